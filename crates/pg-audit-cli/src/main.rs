//! PostgreSQL Audit Proxy CLI
//!
//! A TCP proxy in front of a PostgreSQL server that refuses TLS
//! negotiation and appends every SQL command it relays to an audit log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pg_audit_core::audit::{AuditLogger, FileAuditSink};
use pg_audit_core::config::{LoggingConfig, ProxyConfig, RelayMode};
use pg_audit_core::error::ProxyError;
use pg_audit_core::metrics::ProxyMetrics;
use pg_audit_core::network::ProxyListener;

/// PostgreSQL audit proxy.
#[derive(Parser)]
#[command(name = "pg-audit-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override backend address.
    #[arg(long)]
    backend: Option<String>,

    /// Override audit log path.
    #[arg(long)]
    audit_log: Option<String>,

    /// Override relay mode (request_reply or full_duplex).
    #[arg(long)]
    mode: Option<RelayMode>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(backend) = args.backend {
        config.backend.address = backend;
    }
    if let Some(audit_log) = args.audit_log {
        config.audit.path = audit_log;
    }
    if let Some(mode) = args.mode {
        config.relay.mode = mode;
    }
    config.validate()?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        backend = %config.backend.address(),
        audit_log = %config.audit.path().display(),
        mode = config.relay.mode.as_str(),
        "starting postgres audit proxy"
    );

    // Run the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_proxy(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(ProxyMetrics::new());

    // The audit file is opened once and held for the process lifetime.
    let audit_path = config.audit.path();
    let sink = FileAuditSink::open(&audit_path)
        .await
        .map_err(|source| ProxyError::AuditUnavailable {
            path: audit_path.display().to_string(),
            source,
        })?;
    let audit = Arc::new(AuditLogger::new(sink).with_metrics(Arc::clone(&metrics)));
    info!(path = %audit.destination(), "audit log opened");

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    // Start proxy listener
    let listener = ProxyListener::new(config, audit, metrics);
    let bound = listener.bind().await.context("binding listen address")?;
    let shutdown_handle = listener.shutdown_handle();

    // Handle shutdown signals
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping proxy");
        let _ = shutdown_handle.send(());
    });

    // Run the proxy
    listener.serve(bound).await?;

    info!("proxy shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ProxyMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
