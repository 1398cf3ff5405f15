use anyhow::{Context, Result};
use clap::Args;
use live_origin_core::config::{
    DEFAULT_TLS_PORT, tls_from_parts, validate_root, validate_upstream_url,
};
use live_origin_core::{LiveStreamStore, OriginConfig, parse_origin_toml};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::server::{self, AppState};

/// How long open connections get to finish once shutdown starts
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Server port [default: 8080]
    #[arg(short = 'p', long, env = "ORIGIN_PORT")]
    pub port: Option<u16>,

    /// TLS server port, used when a key is given [default: 8081]
    #[arg(short = 's', long = "ssl-port", env = "ORIGIN_SSL_PORT")]
    pub ssl_port: Option<u16>,

    /// Per-reader rate limit in KiB/s (not Kbit), 0 disables it
    #[arg(short = 'l', long = "rate-limit", env = "ORIGIN_RATE_LIMIT")]
    pub rate_limit: Option<u64>,

    /// Base folder where content is stored [default: data]
    #[arg(short = 'd', long = "dir", env = "ORIGIN_DATA_DIR")]
    pub dir: Option<String>,

    /// TLS private key (PEM)
    #[arg(short = 'K', long, env = "ORIGIN_TLS_KEY")]
    pub key: Option<PathBuf>,

    /// TLS certificate chain (PEM)
    #[arg(short = 'C', long, env = "ORIGIN_TLS_CERT")]
    pub cert: Option<PathBuf>,

    /// Upstream base URL for /takedown/ requests
    #[arg(long = "takedown-url", env = "ORIGIN_TAKEDOWN_URL")]
    pub takedown_url: Option<String>,

    /// Optional TOML file; flags and environment variables override it
    #[arg(long, env = "ORIGIN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Merge defaults, the optional config file and the command line
pub fn resolve_config(args: ServeArgs) -> Result<OriginConfig> {
    let mut config = match &args.config {
        Some(path) => parse_origin_toml(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => OriginConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit_kib = rate_limit;
    }
    if let Some(dir) = &args.dir {
        config.root = validate_root(dir)?;
    }
    if let Some(url) = &args.takedown_url {
        config.takedown_url = validate_upstream_url(url)?;
    }

    if args.key.is_some() || args.cert.is_some() {
        let port = args
            .ssl_port
            .or(config.tls.as_ref().map(|t| t.port))
            .unwrap_or(DEFAULT_TLS_PORT);
        config.tls = tls_from_parts(port, args.cert, args.key)?;
    } else if let (Some(port), Some(tls)) = (args.ssl_port, config.tls.as_mut()) {
        tls.port = port;
    }

    Ok(config)
}

/// Run the origin server until interrupted
pub async fn run(args: ServeArgs) -> Result<()> {
    let config = resolve_config(args)?;

    tokio::fs::create_dir_all(&config.root)
        .await
        .with_context(|| format!("Unable to create base folder {}", config.root.display()))?;
    info!(root = %config.root.display(), "Storage root ready");

    if config.rate_limit_kib > 0 {
        info!(kib_per_sec = config.rate_limit_kib, burst = config.burst_bytes, "Rate limit enabled");
    } else {
        info!("Rate limit: no limit");
    }

    let store = LiveStreamStore::new(config.root.clone());
    let state = AppState::new(store, config.clone());
    let app = server::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to port {}", config.port))?;
    info!(%addr, "Starting server");

    let plain = async {
        axum::serve(listener, app.clone())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")
    };

    match &config.tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load TLS certificate {} / key {}",
                        tls.cert.display(),
                        tls.key.display()
                    )
                })?;

            let tls_addr = SocketAddr::from(([0, 0, 0, 0], tls.port));
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
            });

            info!(addr = %tls_addr, "Starting TLS server");
            let secure = async {
                axum_server::bind_rustls(tls_addr, rustls)
                    .handle(handle)
                    .serve(app.clone().into_make_service())
                    .await
                    .context("TLS server error")
            };

            tokio::try_join!(plain, secure)?;
        }
        None => plain.await?,
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}
