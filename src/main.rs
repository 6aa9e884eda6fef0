mod collectors;
mod config;
mod framer;
mod http;
mod metrics;
mod relay;
mod state;
mod widget;

use axum::serve;
use clap::Parser;
use collectors::processes::ProcessAttributor;
use collectors::supervisor::Supervisor;
use config::{Config, Mode};
use metrics::Metrics;
use relay::RelayClient;
use reqwest::Client;
use state::{now_unix, SharedState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "gpumond")]
#[command(version)]
struct Cli {
    /// YAML config file. Defaults are used when omitted and ./config.yaml is absent.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    #[arg(long)]
    listen: Option<String>,
    /// Base URL of the embedded server, for relay mode.
    #[arg(long)]
    upstream: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        mode = ?cfg.mode,
        "starting gpumond"
    );

    let shared_state = SharedState::new(now_unix());
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let attributor = Arc::new(ProcessAttributor::new(
        &cfg.processes,
        cfg.monitor.device_dir.clone(),
    ));

    let relay = match cfg.mode {
        Mode::Relay => {
            let client = Client::builder()
                .user_agent("gpumond/0.1.0")
                .build()
                .unwrap_or_else(|_| Client::new());
            info!(upstream = %cfg.relay.upstream_url, "relaying widget data");
            Some(RelayClient::new(
                client,
                &cfg.relay.upstream_url,
                cfg.relay.timeout(),
            ))
        }
        Mode::Embedded => None,
    };

    let http_task = {
        let app_state = http::HttpAppState {
            metrics: metrics.clone(),
            state: shared_state.clone(),
            attributor: attributor.clone(),
            widget: Arc::new(cfg.widget.clone()),
            relay,
        };
        let listen = cfg.listen.clone();
        let mode = cfg.mode;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state, mode);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };
            info!(addr = %addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    if cfg.mode == Mode::Embedded {
        let supervisor = Supervisor::new(cfg.monitor.clone(), shared_state.clone(), metrics.clone());
        workers.push(tokio::spawn(supervisor.run(shutdown_rx.clone())));

        workers.push(tokio::spawn(collectors::run_process_scans(
            attributor,
            shared_state.clone(),
            metrics.clone(),
            Duration::from_secs(cfg.processes.interval_secs),
            shutdown_rx.clone(),
        )));
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    let _ = shutdown_tx.send(true);

    for task in workers {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
            Config::load_from_file(DEFAULT_CONFIG_PATH)?
        }
        None => Config::default(),
    };

    if let Some(mode) = cli.mode {
        cfg.mode = mode;
    }
    if let Some(listen) = &cli.listen {
        cfg.listen = listen.clone();
    }
    if let Some(upstream) = &cli.upstream {
        cfg.relay.upstream_url = upstream.clone();
    }

    cfg.validate()?;
    Ok(cfg)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
