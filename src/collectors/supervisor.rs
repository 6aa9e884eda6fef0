use crate::config::MonitorConfig;
use crate::framer::JsonFramer;
use crate::metrics::Metrics;
use crate::state::{SharedState, SupervisorState};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("failed to wait for statistics process: {0}")]
    Wait(#[source] std::io::Error),
}

pub struct Supervisor {
    cfg: MonitorConfig,
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
}

enum RunOutcome {
    Exited(ExitStatus),
    Shutdown,
}

impl Supervisor {
    pub fn new(cfg: MonitorConfig, state: Arc<SharedState>, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            state,
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.cfg.device_dir.is_dir() {
            warn!(
                device_dir = %self.cfg.device_dir.display(),
                "GPU device directory not found, statistics utility will not be started"
            );
            self.state.mark_unavailable();
            self.metrics.set_available(false);
            return;
        }
        log_device_nodes(&self.cfg);

        loop {
            if *shutdown.borrow() {
                return;
            }

            self.state.set_supervisor_state(SupervisorState::Starting);
            match self.run_once(&mut shutdown).await {
                Ok(RunOutcome::Shutdown) => return,
                Ok(RunOutcome::Exited(status)) => {
                    warn!(status = %status, binary = %self.cfg.binary, "statistics utility exited");
                }
                Err(err) => {
                    error!(error = %err, "statistics utility failed");
                }
            }

            self.state.mark_unavailable();
            self.state.set_supervisor_state(SupervisorState::Crashed);
            self.metrics.set_available(false);
            self.metrics.inc_monitor_exit();

            let delay = self.cfg.restart_delay();
            info!(
                delay = %humantime::format_duration(delay),
                "restarting statistics utility after delay"
            );
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunOutcome, SupervisorError> {
        let mut child = self.spawn()?;
        let spawn_no = self.state.record_spawn();
        self.metrics.inc_monitor_spawn();
        self.state.set_supervisor_state(SupervisorState::Running);
        info!(
            binary = %self.cfg.binary,
            args = ?self.cfg.args,
            pid = child.id(),
            spawn = spawn_no,
            "statistics utility started"
        );

        let stdout_task = child.stdout.take().map(|stdout| {
            let state = self.state.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(pump_stdout(stdout, state, metrics))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let state = self.state.clone();
            let metrics = self.metrics.clone();
            let patterns = self.cfg.fatal_patterns.clone();
            tokio::spawn(watch_stderr(stderr, patterns, state, metrics))
        });

        let mut readers: Vec<JoinHandle<()>> =
            [stdout_task, stderr_task].into_iter().flatten().collect();

        let status = tokio::select! {
            _ = shutdown.changed() => {
                info!("stopping statistics utility");
                terminate(&mut child).await;
                abort_all(&readers);
                return Ok(RunOutcome::Shutdown);
            }
            status = child.wait() => status,
        };
        self.state.set_supervisor_state(SupervisorState::Crashed);

        // Frames written just before exit are still in the pipe. A grandchild
        // that inherited the pipe can hold it open forever, so the drain is
        // bounded.
        let mut shutting_down = false;
        tokio::select! {
            _ = drain(&mut readers) => {}
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!("statistics output still open after exit, abandoning readers");
            }
            _ = shutdown.changed() => shutting_down = true,
        }
        abort_all(&readers);

        if shutting_down {
            return Ok(RunOutcome::Shutdown);
        }
        status.map(RunOutcome::Exited).map_err(SupervisorError::Wait)
    }

    fn spawn(&self) -> Result<Child, SupervisorError> {
        Command::new(&self.cfg.binary)
            .args(&self.cfg.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: self.cfg.binary.clone(),
                source,
            })
    }
}

async fn drain(readers: &mut [JoinHandle<()>]) {
    for task in readers.iter_mut() {
        let _ = task.await;
    }
}

fn abort_all(readers: &[JoinHandle<()>]) {
    for task in readers {
        task.abort();
    }
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to kill statistics utility");
    }
}

fn log_device_nodes(cfg: &MonitorConfig) {
    match std::fs::read_dir(&cfg.device_dir) {
        Ok(entries) => {
            let names: Vec<String> = entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            info!(device_dir = %cfg.device_dir.display(), devices = ?names, "GPU device nodes");
        }
        Err(err) => {
            warn!(device_dir = %cfg.device_dir.display(), error = %err, "failed to list GPU device nodes");
        }
    }
}

pub async fn pump_stdout<R>(mut reader: R, state: Arc<SharedState>, metrics: Arc<Metrics>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = JsonFramer::new();
    let mut buf = vec![0_u8; READ_CHUNK];
    let mut dropped = 0_u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "failed to read statistics output");
                break;
            }
        };

        for value in framer.feed(&buf[..n]) {
            metrics.update_from_snapshot(&value);
            state.publish_snapshot(value);
        }
        if framer.dropped() > dropped {
            metrics.inc_frames_dropped(framer.dropped() - dropped);
            dropped = framer.dropped();
        }
    }

    debug!(
        decoded = framer.decoded(),
        dropped = framer.dropped(),
        partial = framer.in_object(),
        buffered = framer.buffered_len(),
        "statistics output closed"
    );
}

pub async fn watch_stderr<R>(
    reader: R,
    patterns: Vec<String>,
    state: Arc<SharedState>,
    metrics: Arc<Metrics>,
) where
    R: AsyncRead + Unpin,
{
    let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(line = %line, "statistics utility stderr");
                if is_fatal(&line, &patterns) {
                    error!(line = %line, "statistics utility reports GPU unavailable");
                    state.mark_unavailable();
                    metrics.set_available(false);
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "failed to read statistics stderr");
                break;
            }
        }
    }
}

fn is_fatal(line: &str, lowered_patterns: &[String]) -> bool {
    let line = line.to_lowercase();
    lowered_patterns.iter().any(|p| line.contains(p.as_str()))
}
