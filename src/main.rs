use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use tierguard::{api, offline, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /health and exit
    // immediately — no external curl/wget needed in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tierguard=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("TIERGUARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/tierguard/config.toml"));

    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file; using defaults");
        Config::default()
    };

    // The offline flag is process-wide; set it before any client is built so
    // URL validation sees the right mode.
    offline::set_mode(config.gateway.offline);

    info!(
        port = config.gateway.port,
        mode = ?config.router.mode,
        paranoid = config.gateway.paranoid,
        offline = config.gateway.offline,
        cloud = config.remote.api_key().is_some(),
        "tierguard starting"
    );

    let state = Arc::new(api::ServerState::new(config)?);

    // Config hot-reload: content-digest polling, swaps routing knobs only.
    tokio::spawn(config_watcher(Arc::clone(&state), config_path));

    // Loopback only. Exposure beyond the host is a reverse proxy's problem,
    // with its own authentication story.
    let addr = SocketAddr::from(([127, 0, 0, 1], state.config().gateway.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "gateway listening");

    let app = api::router(Arc::clone(&state));

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.context("gateway server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("TIERGUARD_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// How often the config file is checked for changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Background task: hot-swap the routing knobs when the config file's
/// *contents* change.
///
/// Change detection hashes the file rather than comparing mtimes — an
/// editor that restores timestamps still triggers a reload, and a bare
/// `touch` does not. A revision that fails to parse is remembered by its
/// digest, so the rejection is logged once instead of on every poll; the
/// gateway keeps serving the last good config either way.
async fn config_watcher(state: Arc<api::ServerState>, path: PathBuf) {
    fn digest(path: &std::path::Path) -> Option<[u8; 32]> {
        use sha2::Digest as _;
        let bytes = std::fs::read(path).ok()?;
        Some(sha2::Sha256::digest(&bytes).into())
    }

    let mut seen = digest(&path);
    loop {
        tokio::time::sleep(CONFIG_POLL_INTERVAL).await;

        let latest = digest(&path);
        if latest.is_none() || latest == seen {
            // Unreadable (deleted mid-edit?) or unchanged; check again later.
            continue;
        }
        seen = latest;

        match Config::load(&path) {
            Ok(new_config) => {
                state.replace_config(Arc::new(new_config));
                info!(path = %path.display(), "configuration change applied");
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "new configuration rejected; still serving the previous one"
                );
            }
        }
    }
}
