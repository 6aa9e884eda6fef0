use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub processes: ProcessesConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub widget: WidgetConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Embedded,
    Relay,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_fatal_patterns")]
    pub fatal_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessesConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_drm_clients_path")]
    pub drm_clients_path: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
    #[serde(default = "default_lsof_binary")]
    pub lsof_binary: String,
    #[serde(default = "default_fuser_binary")]
    pub fuser_binary: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WidgetConfig {
    #[serde(default)]
    pub layout: WidgetLayout,
    #[serde(default = "default_widget_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default)]
    pub link: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetLayout {
    #[default]
    Items,
    FourStats,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: Mode::default(),
            monitor: MonitorConfig::default(),
            processes: ProcessesConfig::default(),
            relay: RelayConfig::default(),
            widget: WidgetConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            device_dir: default_device_dir(),
            restart_delay_secs: default_restart_delay_secs(),
            fatal_patterns: default_fatal_patterns(),
        }
    }
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            drm_clients_path: default_drm_clients_path(),
            proc_root: default_proc_root(),
            lsof_binary: default_lsof_binary(),
            fuser_binary: default_fuser_binary(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: default_upstream_url(),
            timeout_ms: default_relay_timeout_ms(),
        }
    }
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            layout: WidgetLayout::default(),
            refresh_secs: default_widget_refresh_secs(),
            link: String::new(),
        }
    }
}

impl MonitorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        let listen = SocketAddr::from_str(&self.listen).map_err(|_| {
            ConfigError::Validation("listen must be a host:port socket address".to_string())
        })?;

        validate_monitor(&self.monitor)?;
        validate_processes(&self.processes)?;
        if self.mode == Mode::Relay {
            validate_relay(&self.relay, &listen)?;
        }
        if self.widget.refresh_secs < 1 {
            return Err(ConfigError::Validation(
                "widget.refresh_secs must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_monitor(cfg: &MonitorConfig) -> Result<(), ConfigError> {
    if cfg.binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "monitor.binary must not be empty".to_string(),
        ));
    }
    if cfg.restart_delay_secs < 1 {
        return Err(ConfigError::Validation(
            "monitor.restart_delay_secs must be >= 1".to_string(),
        ));
    }
    if cfg.fatal_patterns.iter().any(|p| p.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "monitor.fatal_patterns entries must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_processes(cfg: &ProcessesConfig) -> Result<(), ConfigError> {
    if cfg.interval_secs < 1 {
        return Err(ConfigError::Validation(
            "processes.interval_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_relay(cfg: &RelayConfig, listen: &SocketAddr) -> Result<(), ConfigError> {
    let url = cfg.upstream_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Validation(format!(
            "relay.upstream_url '{}' must be an http(s) URL",
            cfg.upstream_url
        )));
    }
    if upstream_is_self(url, listen) {
        return Err(ConfigError::Validation(format!(
            "relay.upstream_url '{}' points back at this relay ({listen})",
            cfg.upstream_url
        )));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "relay.timeout_ms must be > 0".to_string(),
        ));
    }
    Ok(())
}

// A relay has no /api/gpu of its own, so an upstream on the local listen
// port would only ever answer 404.
fn upstream_is_self(url: &str, listen: &SocketAddr) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let Some((host, tail)) = bracketed.split_once(']') else {
            return false;
        };
        (host, tail.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(port) => port,
            Err(_) => return false,
        },
        None if scheme.eq_ignore_ascii_case("https") => 443,
        None => 80,
    };
    if port != listen.port() {
        return false;
    }

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified() || ip == listen.ip(),
        Err(_) => false,
    }
}

fn default_listen() -> String {
    "0.0.0.0:8847".to_string()
}

fn default_binary() -> String {
    "intel_gpu_top".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-J".to_string(), "-s".to_string(), "1000".to_string()]
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/dri")
}

const fn default_restart_delay_secs() -> u64 {
    5
}

fn default_fatal_patterns() -> Vec<String> {
    vec!["No device found".to_string(), "Permission denied".to_string()]
}

const fn default_scan_interval_secs() -> u64 {
    2
}

fn default_drm_clients_path() -> PathBuf {
    PathBuf::from("/sys/kernel/debug/dri/0/clients")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_lsof_binary() -> String {
    "lsof".to_string()
}

fn default_fuser_binary() -> String {
    "fuser".to_string()
}

fn default_upstream_url() -> String {
    "http://gpu-monitor:8847".to_string()
}

const fn default_relay_timeout_ms() -> u64 {
    5000
}

const fn default_widget_refresh_secs() -> u64 {
    5
}
