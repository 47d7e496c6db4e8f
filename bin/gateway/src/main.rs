use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gateway_api::GatewayConfig;
use gateway_proxy::gateway::DEFAULT_MAX_BODY_BYTES;
use gateway_proxy::{tls_acceptor, GatewayComponents, SharedGateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Declarative API gateway", long_about = None)]
struct Args {
    /// Gateway configuration file, YAML or JSON
    #[arg(short, long, env = "GATEWAY_CONFIG", default_value = "gateway.config.yml")]
    config: PathBuf,

    #[arg(long, env = "GATEWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Upper bound on a single policy invocation
    #[arg(long, env = "GATEWAY_POLICY_TIMEOUT_MS", default_value_t = 60_000)]
    policy_timeout_ms: u64,

    /// Request bodies larger than this are answered with 413
    #[arg(long, env = "GATEWAY_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting gateway...");

    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!("Configuration loaded from {}", args.config.display());

    let mut components = GatewayComponents::new(Duration::from_millis(args.policy_timeout_ms))?;
    components.max_body_bytes = args.max_body_bytes;
    let gateway = Arc::new(SharedGateway::new(&config, components).context("Failed to build pipelines")?);

    let http_listener = TcpListener::bind((config.http.host.as_str(), config.http.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.http.host, config.http.port))?;
    info!("HTTP server listening on {}", http_listener.local_addr()?);

    match config.https.as_ref() {
        Some(https) => match &https.tls {
            Some(tls) => {
                let acceptor = tls_acceptor(tls)?;
                let https_listener = TcpListener::bind((https.host.as_str(), https.port))
                    .await
                    .with_context(|| format!("Failed to bind {}:{}", https.host, https.port))?;
                info!("HTTPS server listening on {}", https_listener.local_addr()?);
                tokio::spawn(server::accept_https_connections(https_listener, acceptor, gateway.clone()));
            }
            None => warn!("HTTPS listener configured without tls - not started"),
        },
        None => info!("HTTPS listener not configured"),
    }

    tokio::spawn(reload_on_hangup(args.config.clone(), gateway.clone()));

    server::accept_http_connections(http_listener, gateway).await
}

/// Rebuild pipelines from `path` on every SIGHUP
///
/// Listener settings are only read at startup.
#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, gateway: Arc<SharedGateway>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler, reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", path.display());
        match GatewayConfig::from_file(&path) {
            Ok(config) => {
                if let Err(e) = gateway.reload(&config) {
                    error!("Reload rejected, keeping current configuration: {}", e);
                }
            }
            Err(e) => error!("Reload failed, keeping current configuration: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_path: PathBuf, _gateway: Arc<SharedGateway>) {}
