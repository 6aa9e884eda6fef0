use crate::collectors::cmdline::{attribute_media, CommandLine};
use crate::config::ProcessesConfig;
use crate::state::GpuProcessEntry;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

/// In priority order. Results are never merged across strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    DrmClients { path: PathBuf },
    Lsof { binary: String },
    Fuser { binary: String },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::DrmClients { .. } => "drm_clients",
            Strategy::Lsof { .. } => "lsof",
            Strategy::Fuser { .. } => "fuser",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Found(Vec<GpuProcessEntry>),
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct ProcessAttributor {
    strategies: Vec<Strategy>,
    device_dir: PathBuf,
    proc_root: PathBuf,
}

impl ProcessAttributor {
    pub fn new(cfg: &ProcessesConfig, device_dir: impl Into<PathBuf>) -> Self {
        Self {
            strategies: vec![
                Strategy::DrmClients {
                    path: cfg.drm_clients_path.clone(),
                },
                Strategy::Lsof {
                    binary: cfg.lsof_binary.clone(),
                },
                Strategy::Fuser {
                    binary: cfg.fuser_binary.clone(),
                },
            ],
            device_dir: device_dir.into(),
            proc_root: cfg.proc_root.clone(),
        }
    }

    pub fn with_strategies(
        strategies: Vec<Strategy>,
        device_dir: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            strategies,
            device_dir: device_dir.into(),
            proc_root: proc_root.into(),
        }
    }

    pub async fn scan(&self) -> (Option<&'static str>, Vec<GpuProcessEntry>) {
        for strategy in &self.strategies {
            match self.discover(strategy).await {
                Discovery::Found(list) => return (Some(strategy.name()), list),
                Discovery::Unavailable => {
                    debug!(strategy = strategy.name(), "process discovery strategy unavailable");
                }
            }
        }
        (None, Vec::new())
    }

    pub async fn discover(&self, strategy: &Strategy) -> Discovery {
        match strategy {
            Strategy::DrmClients { path } => self.discover_drm_clients(path).await,
            Strategy::Lsof { binary } => self.discover_lsof(binary).await,
            Strategy::Fuser { binary } => self.discover_fuser(binary).await,
        }
    }

    async fn discover_drm_clients(&self, path: &Path) -> Discovery {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "drm clients file unreadable");
                return Discovery::Unavailable;
            }
        };

        let mut out = Vec::new();
        for (command, pid) in parse_drm_clients(&text) {
            out.push(self.resolve(command, pid).await);
        }
        Discovery::Found(out)
    }

    async fn discover_lsof(&self, binary: &str) -> Discovery {
        let devices = self.device_nodes().await;
        if devices.is_empty() {
            return Discovery::Unavailable;
        }
        let Some(stdout) = run_listing(binary, &devices).await else {
            return Discovery::Unavailable;
        };

        let mut out = Vec::new();
        for (command, pid) in parse_lsof(&stdout) {
            out.push(self.resolve(command, pid).await);
        }
        Discovery::Found(out)
    }

    async fn discover_fuser(&self, binary: &str) -> Discovery {
        let devices = self.device_nodes().await;
        if devices.is_empty() {
            return Discovery::Unavailable;
        }
        let Some(stdout) = run_listing(binary, &devices).await else {
            return Discovery::Unavailable;
        };

        let mut out = Vec::new();
        for pid in parse_fuser(&stdout) {
            // Processes that exit before their record is read are skipped.
            let Ok(cmdline) = self.read_cmdline(pid).await else {
                continue;
            };
            let command = cmdline.program().unwrap_or_else(|| "unknown".to_string());
            let name = cmdline.display_name().unwrap_or_else(|| command.clone());
            let media = attribute_media(&command, &name, &cmdline);
            out.push(GpuProcessEntry {
                name,
                pid,
                command,
                media,
            });
        }
        Discovery::Found(out)
    }

    async fn resolve(&self, command: String, pid: u32) -> GpuProcessEntry {
        match self.read_cmdline(pid).await {
            Ok(cmdline) => {
                let name = cmdline.display_name().unwrap_or_else(|| command.clone());
                let media = attribute_media(&command, &name, &cmdline);
                GpuProcessEntry {
                    name,
                    pid,
                    command,
                    media,
                }
            }
            Err(_) => GpuProcessEntry {
                name: command.clone(),
                pid,
                command,
                media: None,
            },
        }
    }

    async fn read_cmdline(&self, pid: u32) -> io::Result<CommandLine> {
        let raw = fs::read(self.proc_root.join(pid.to_string()).join("cmdline")).await?;
        Ok(CommandLine::parse(&raw))
    }

    async fn device_nodes(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.device_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("render") || name.starts_with("card") {
                out.push(entry.path());
            }
        }
        out.sort();
        out
    }
}

/// Runs a listing utility. `None` only when it cannot be started; a non-zero
/// exit (both tools exit 1 when nobody holds the files) yields its stdout.
async fn run_listing(binary: &str, devices: &[PathBuf]) -> Option<String> {
    let output = Command::new(binary)
        .args(devices)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;
    match output {
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Err(err) => {
            debug!(binary, error = %err, "listing utility unavailable");
            None
        }
    }
}

/// Columns after the command in a debugfs `clients` row:
/// pid, dev, master, a, uid, magic.
const DRM_CLIENT_TRAILING_FIELDS: usize = 6;

/// Header line first, then one row per client. The command is the task
/// `comm`, which may contain spaces, so the row is read from the right.
pub fn parse_drm_clients(text: &str) -> Vec<(String, u32)> {
    text.lines()
        .skip(1)
        .filter_map(|line| drm_client_row(line).or_else(|| short_client_row(line)))
        .collect()
}

fn drm_client_row(line: &str) -> Option<(String, u32)> {
    let mut rest = line;
    let mut pid = None;
    for _ in 0..DRM_CLIENT_TRAILING_FIELDS {
        let (head, field) = split_last_field(rest)?;
        pid = Some(field);
        rest = head;
    }
    let pid = pid?.parse::<u32>().ok()?;
    let command = rest.trim();
    if command.is_empty() {
        return None;
    }
    Some((command.to_string(), pid))
}

// Rows holding only `command pid`.
fn short_client_row(line: &str) -> Option<(String, u32)> {
    let mut fields = line.split_whitespace();
    let command = fields.next()?;
    let pid = fields.next()?.parse::<u32>().ok()?;
    Some((command.to_string(), pid))
}

fn split_last_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_end();
    let idx = s.rfind(|c: char| c.is_ascii_whitespace())?;
    Some((&s[..idx], &s[idx + 1..]))
}

pub fn parse_lsof(text: &str) -> Vec<(String, u32)> {
    let mut seen = HashSet::new();
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let command = fields.next()?;
            let pid = fields.next()?.parse::<u32>().ok()?;
            Some((command.to_string(), pid))
        })
        .filter(|pair| seen.insert(pair.clone()))
        .collect()
}

/// PIDs may carry access letters (`1234m`).
pub fn parse_fuser(text: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    text.split_whitespace()
        .filter_map(|token| {
            let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse::<u32>().ok()
        })
        .filter(|pid| seen.insert(*pid))
        .collect()
}
