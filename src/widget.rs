use crate::config::{WidgetConfig, WidgetLayout};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const PLACEHOLDER: &str = "--";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub gpu_busy: f64,
    pub frequency_mhz: f64,
    pub power_watts: f64,
    pub rc6_percent: f64,
    pub video_busy: f64,
    pub render_busy: f64,
}

impl Summary {
    pub fn from_snapshot(data: &Value) -> Self {
        let engines = data.get("engines");
        Self {
            gpu_busy: average_busy(engines),
            frequency_mhz: number_at(data, &["frequency", "actual"]),
            power_watts: number_at(data, &["power", "GPU"]),
            rc6_percent: number_at(data, &["rc6", "value"]),
            video_busy: engine_busy(engines, &["Video/0", "Video"]),
            render_busy: engine_busy(engines, &["Render/3D/0", "Render/3D"]),
        }
    }
}

/// Mean `busy` over the engines that report a numeric one; 0 without any.
pub fn average_busy(engines: Option<&Value>) -> f64 {
    let Some(engines) = engines.and_then(Value::as_object) else {
        return 0.0;
    };
    let (sum, count) = engines
        .values()
        .filter_map(|engine| engine.get("busy").and_then(Value::as_f64))
        .fold((0.0_f64, 0_u32), |(sum, count), busy| (sum + busy, count + 1));
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

fn engine_busy(engines: Option<&Value>, names: &[&str]) -> f64 {
    names
        .iter()
        .find_map(|name| engines.and_then(|e| e.get(*name)))
        .and_then(|engine| engine.get("busy"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn number_at(data: &Value, path: &[&str]) -> f64 {
    path.iter()
        .try_fold(data, |node, key| node.get(*key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetItem {
    pub title: &'static str,
    pub text: String,
    pub subtext: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetStat {
    pub title: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WidgetPayload {
    Items {
        items: Vec<WidgetItem>,
    },
    FourStats {
        #[serde(rename = "type")]
        kind: &'static str,
        refresh: String,
        link: String,
        stats: Vec<WidgetStat>,
    },
}

pub fn render(cfg: &WidgetConfig, summary: Option<Summary>) -> WidgetPayload {
    match cfg.layout {
        WidgetLayout::Items => render_items(summary),
        WidgetLayout::FourStats => render_four_stats(cfg, summary),
    }
}

fn render_items(summary: Option<Summary>) -> WidgetPayload {
    let text = |value: Option<f64>, decimals: usize| match value {
        Some(v) => format!("{v:.decimals$}"),
        None => PLACEHOLDER.to_string(),
    };
    let items = vec![
        WidgetItem {
            title: "GPU Usage",
            text: text(summary.map(|s| s.gpu_busy), 1),
            subtext: "%",
        },
        WidgetItem {
            title: "Frequency",
            text: text(summary.map(|s| s.frequency_mhz), 0),
            subtext: "MHz",
        },
        WidgetItem {
            title: "Power",
            text: text(summary.map(|s| s.power_watts), 1),
            subtext: "W",
        },
        WidgetItem {
            title: "RC6 Idle",
            text: text(summary.map(|s| s.rc6_percent), 1),
            subtext: "%",
        },
    ];
    WidgetPayload::Items { items }
}

fn render_four_stats(cfg: &WidgetConfig, summary: Option<Summary>) -> WidgetPayload {
    let value = |v: Option<f64>, unit: &str| match v {
        Some(v) => format!("{v:.1}{unit}"),
        None => PLACEHOLDER.to_string(),
    };
    let stats = vec![
        WidgetStat {
            title: "GPU Usage",
            value: value(summary.map(|s| s.gpu_busy), "%"),
        },
        WidgetStat {
            title: "Video Engine",
            value: value(summary.map(|s| s.video_busy), "%"),
        },
        WidgetStat {
            title: "Render Engine",
            value: value(summary.map(|s| s.render_busy), "%"),
        },
        WidgetStat {
            title: "Power",
            value: value(summary.map(|s| s.power_watts), "W"),
        },
    ];
    WidgetPayload::FourStats {
        kind: "four-stats",
        refresh: humantime::format_duration(Duration::from_secs(cfg.refresh_secs)).to_string(),
        link: cfg.link.clone(),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "frequency": {"requested": 1300.0, "actual": 1249.6},
            "power": {"GPU": 3.456, "Package": 12.0},
            "rc6": {"value": 41.26},
            "engines": {
                "Render/3D/0": {"busy": 30.0},
                "Video/0": {"busy": 60.0},
                "Blitter/0": {"busy": 0.0},
                "VideoEnhance/0": {"unit": "%"}
            }
        })
    }

    #[test]
    fn average_of_engines() {
        let engines = json!({"A": {"busy": 10}, "B": {"busy": 30}});
        assert_eq!(average_busy(Some(&engines)), 20.0);
        assert_eq!(average_busy(Some(&json!({}))), 0.0);
        assert_eq!(average_busy(None), 0.0);
        assert_eq!(average_busy(Some(&json!({"A": {"busy": "high"}}))), 0.0);
    }

    #[test]
    fn summary_reads_known_fields() {
        let s = Summary::from_snapshot(&sample());
        assert_eq!(s.gpu_busy, 30.0);
        assert_eq!(s.frequency_mhz, 1249.6);
        assert_eq!(s.power_watts, 3.456);
        assert_eq!(s.rc6_percent, 41.26);
        assert_eq!(s.video_busy, 60.0);
        assert_eq!(s.render_busy, 30.0);
    }

    #[test]
    fn missing_sections_are_zero() {
        let s = Summary::from_snapshot(&json!({"engines": {"Video": {"busy": 5.0}}}));
        assert_eq!(s.frequency_mhz, 0.0);
        assert_eq!(s.power_watts, 0.0);
        assert_eq!(s.rc6_percent, 0.0);
        assert_eq!(s.video_busy, 5.0);
        assert_eq!(s.render_busy, 0.0);
    }

    #[test]
    fn items_layout_formats_values() {
        let payload = render(&WidgetConfig::default(), Some(Summary::from_snapshot(&sample())));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"items": [
                {"title": "GPU Usage", "text": "30.0", "subtext": "%"},
                {"title": "Frequency", "text": "1250", "subtext": "MHz"},
                {"title": "Power", "text": "3.5", "subtext": "W"},
                {"title": "RC6 Idle", "text": "41.3", "subtext": "%"}
            ]})
        );
    }

    #[test]
    fn items_placeholder() {
        let value = serde_json::to_value(render(&WidgetConfig::default(), None)).unwrap();
        let texts: Vec<_> = value["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["--"; 4]);
    }

    #[test]
    fn four_stats_layout() {
        let cfg = WidgetConfig {
            layout: WidgetLayout::FourStats,
            ..WidgetConfig::default()
        };
        let value =
            serde_json::to_value(render(&cfg, Some(Summary::from_snapshot(&sample())))).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "four-stats",
                "refresh": "5s",
                "link": "",
                "stats": [
                    {"title": "GPU Usage", "value": "30.0%"},
                    {"title": "Video Engine", "value": "60.0%"},
                    {"title": "Render Engine", "value": "30.0%"},
                    {"title": "Power", "value": "3.5W"}
                ]
            })
        );

        let placeholder = serde_json::to_value(render(&cfg, None)).unwrap();
        assert_eq!(placeholder["stats"][3]["value"], "--");
        assert_eq!(placeholder["type"], "four-stats");
    }
}
