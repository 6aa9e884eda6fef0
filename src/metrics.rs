use crate::state::SharedState;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, IntCounter, Registry, TextEncoder,
};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub gpu_available: Gauge,
    pub engine_busy_percent: GaugeVec,
    pub frequency_actual_mhz: Gauge,
    pub frequency_requested_mhz: Gauge,
    pub power_watts: GaugeVec,
    pub rc6_percent: Gauge,
    pub gpu_process_count: Gauge,
    pub frames_decoded_total: IntCounter,
    pub frames_dropped_total: IntCounter,
    pub monitor_spawns_total: IntCounter,
    pub monitor_exits_total: IntCounter,
    pub process_scans_total: CounterVec,
    pub relay_errors_total: IntCounter,
    pub scrape_count_total: Counter,
    pub uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let gpu_available = Gauge::with_opts(opts!(
            "gpumond_gpu_available",
            "1 when the statistics utility is producing data, else 0"
        ))?;
        let engine_busy_percent = GaugeVec::new(
            opts!(
                "gpumond_engine_busy_percent",
                "Engine busy percentage from the latest snapshot"
            ),
            &["engine"],
        )?;
        let frequency_actual_mhz = Gauge::with_opts(opts!(
            "gpumond_frequency_actual_mhz",
            "Actual GPU frequency in MHz"
        ))?;
        let frequency_requested_mhz = Gauge::with_opts(opts!(
            "gpumond_frequency_requested_mhz",
            "Requested GPU frequency in MHz"
        ))?;
        let power_watts = GaugeVec::new(
            opts!("gpumond_power_watts", "Power draw in watts by domain"),
            &["domain"],
        )?;
        let rc6_percent = Gauge::with_opts(opts!(
            "gpumond_rc6_percent",
            "Time spent in RC6 idle state in percent"
        ))?;
        let gpu_process_count = Gauge::with_opts(opts!(
            "gpumond_gpu_process_count",
            "Processes holding a GPU device at the last scan"
        ))?;
        let frames_decoded_total = IntCounter::with_opts(opts!(
            "gpumond_frames_decoded_total",
            "JSON objects decoded from the statistics utility"
        ))?;
        let frames_dropped_total = IntCounter::with_opts(opts!(
            "gpumond_frames_dropped_total",
            "Balanced objects that failed to decode"
        ))?;
        let monitor_spawns_total = IntCounter::with_opts(opts!(
            "gpumond_monitor_spawns_total",
            "Statistics utility spawns"
        ))?;
        let monitor_exits_total = IntCounter::with_opts(opts!(
            "gpumond_monitor_exits_total",
            "Statistics utility exits and spawn failures"
        ))?;
        let process_scans_total = CounterVec::new(
            opts!(
                "gpumond_process_scans_total",
                "GPU process scans by the strategy that answered"
            ),
            &["strategy"],
        )?;
        let relay_errors_total = IntCounter::with_opts(opts!(
            "gpumond_relay_errors_total",
            "Failed upstream requests in relay mode"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "gpumond_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let uptime_seconds = Gauge::with_opts(opts!(
            "gpumond_uptime_seconds",
            "Seconds since the service started"
        ))?;

        register(&registry, &gpu_available)?;
        register(&registry, &engine_busy_percent)?;
        register(&registry, &frequency_actual_mhz)?;
        register(&registry, &frequency_requested_mhz)?;
        register(&registry, &power_watts)?;
        register(&registry, &rc6_percent)?;
        register(&registry, &gpu_process_count)?;
        register(&registry, &frames_decoded_total)?;
        register(&registry, &frames_dropped_total)?;
        register(&registry, &monitor_spawns_total)?;
        register(&registry, &monitor_exits_total)?;
        register(&registry, &process_scans_total)?;
        register(&registry, &relay_errors_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            gpu_available,
            engine_busy_percent,
            frequency_actual_mhz,
            frequency_requested_mhz,
            power_watts,
            rc6_percent,
            gpu_process_count,
            frames_decoded_total,
            frames_dropped_total,
            monitor_spawns_total,
            monitor_exits_total,
            process_scans_total,
            relay_errors_total,
            scrape_count_total,
            uptime_seconds,
        }))
    }

    /// Mirrors one decoded snapshot. Fields missing from the snapshot leave
    /// their gauges untouched, except per-engine and per-domain series which
    /// are rebuilt each time.
    pub fn update_from_snapshot(&self, data: &Value) {
        self.frames_decoded_total.inc();
        self.gpu_available.set(1.0);

        self.engine_busy_percent.reset();
        if let Some(engines) = data.get("engines").and_then(Value::as_object) {
            for (name, engine) in engines {
                if let Some(busy) = engine.get("busy").and_then(Value::as_f64) {
                    self.engine_busy_percent
                        .with_label_values(&[name.as_str()])
                        .set(busy);
                }
            }
        }

        if let Some(frequency) = data.get("frequency") {
            if let Some(v) = frequency.get("actual").and_then(Value::as_f64) {
                self.frequency_actual_mhz.set(v);
            }
            if let Some(v) = frequency.get("requested").and_then(Value::as_f64) {
                self.frequency_requested_mhz.set(v);
            }
        }

        self.power_watts.reset();
        if let Some(power) = data.get("power").and_then(Value::as_object) {
            for (domain, watts) in power {
                if let Some(w) = watts.as_f64() {
                    self.power_watts.with_label_values(&[domain.as_str()]).set(w);
                }
            }
        }

        if let Some(v) = data
            .get("rc6")
            .and_then(|rc6| rc6.get("value"))
            .and_then(Value::as_f64)
        {
            self.rc6_percent.set(v);
        }
    }

    pub fn set_available(&self, available: bool) {
        self.gpu_available.set(if available { 1.0 } else { 0.0 });
    }

    pub fn inc_frames_dropped(&self, n: u64) {
        self.frames_dropped_total.inc_by(n);
    }

    pub fn inc_monitor_spawn(&self) {
        self.monitor_spawns_total.inc();
    }

    pub fn inc_monitor_exit(&self) {
        self.monitor_exits_total.inc();
    }

    pub fn record_process_scan(&self, strategy: &str, count: usize) {
        self.process_scans_total
            .with_label_values(&[strategy])
            .inc();
        self.gpu_process_count.set(count as f64);
    }

    pub fn inc_relay_error(&self) {
        self.relay_errors_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn update_uptime(&self, state: &SharedState) {
        let uptime = crate::state::now_unix().saturating_sub(state.started_at_unix()) as f64;
        self.uptime_seconds.set(uptime);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
