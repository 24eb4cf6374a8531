mod config;
mod interpret;
mod logging;
mod pidfile;
mod proxy;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use owo_colors::OwoColorize;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigOverrides, default_config_path, load_config};
use crate::logging::JsonlLogger;
use crate::pidfile::PidGuard;
use crate::proxy::{ProxyService, router as proxy_router};

/// OpenAI-compatible logging proxy: forwards every request to the configured
/// upstream and records prompts, responses, and tool calls as JSONL.
#[derive(Parser, Debug)]
#[command(name = "plens", version)]
#[command(about = "OpenAI-compatible logging proxy for LLM interactions", long_about = None)]
struct Cli {
    /// Path to TOML config file. Defaults to ./promptlens.toml if present.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Bind port
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Directory to write JSONL logs (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Upstream OpenAI-compatible base URL (overrides config)
    #[arg(long)]
    llm_endpoint: Option<String>,
    /// Upstream request timeout in seconds (overrides config)
    #[arg(long = "timeout")]
    timeout_s: Option<f64>,
    /// Rotate logs when the active file would exceed this size (overrides config)
    #[arg(long)]
    max_log_file_bytes: Option<u64>,
    /// Max bytes of extracted content stored per log event (overrides config)
    #[arg(long)]
    max_prompt_bytes: Option<u64>,
    /// PID file path (default: <log-dir>/plens.pid)
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Invalid or unreadable configuration; fatal at startup.
    #[error("Config error: {0}")]
    Config(String),
    /// Another instance appears to be running.
    #[error("{0}")]
    Pidfile(String),
    /// Bad command-line invocation.
    #[error("{0}")]
    Usage(String),
    /// Generic fallback for other failures.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e.to_string())
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().or_else(default_config_path);
    if config_path.is_none() && cli.llm_endpoint.is_none() {
        return Err(CliError::Usage(
            "Provide --config or --llm-endpoint (or create ./promptlens.toml).".to_string(),
        ));
    }

    let cfg = load_config(config_path.as_deref()).map_err(|e| CliError::Config(format!("{e:#}")))?;
    let cfg = cfg
        .with_overrides(&ConfigOverrides {
            base_url: cli.llm_endpoint.clone(),
            timeout_s: cli.timeout_s,
            log_dir: cli.log_dir.clone(),
            max_file_bytes: cli.max_log_file_bytes,
            max_prompt_bytes: cli.max_prompt_bytes,
        })
        .map_err(|e| CliError::Config(format!("{e:#}")))?;

    std::fs::create_dir_all(&cfg.logging.log_dir).map_err(|e| {
        CliError::Config(format!(
            "failed to create log dir {:?}: {e}",
            cfg.logging.log_dir
        ))
    })?;

    init_tracing(&cfg);

    let pid_path = cli
        .pid_file
        .clone()
        .unwrap_or_else(|| cfg.logging.log_dir.join("plens.pid"));
    let pid_guard =
        PidGuard::acquire(pid_path).map_err(|e| CliError::Pidfile(format!("{e:#}")))?;
    tracing::debug!("pidfile acquired at {:?}", pid_guard.path());

    let result = run_server(Arc::new(cfg), &cli.host, cli.port).await;
    // The pidfile is released after the server has fully shut down.
    drop(pid_guard);
    result.map_err(|e| CliError::Other(format!("{e:#}")))
}

fn init_tracing(cfg: &AppConfig) {
    // RUST_LOG wins; otherwise fall back to the configured server log level.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.server.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn build_http_client(cfg: &AppConfig) -> anyhow::Result<Client> {
    let mut default_headers = HeaderMap::new();
    for (name, value) in &cfg.upstream.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid upstream header name {name:?}: {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow::anyhow!("invalid upstream header value for {name:?}: {e}"))?;
        default_headers.insert(name, value);
    }

    let mut builder = Client::builder()
        .timeout(Duration::from_secs_f64(cfg.upstream.timeout_s))
        .default_headers(default_headers);
    if !cfg.upstream.verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

async fn run_server(cfg: Arc<AppConfig>, host: &str, port: u16) -> anyhow::Result<()> {
    let logger = Arc::new(JsonlLogger::from_config(&cfg.logging)?);
    let client = build_http_client(&cfg)?;

    let proxy = ProxyService::new(client, cfg.clone(), logger);
    let app: Router = proxy_router(proxy);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(
        "promptlens listening on http://{} (upstream: {})",
        addr,
        cfg.upstream.base_url
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    let server_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(server_shutdown)
        .await?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
