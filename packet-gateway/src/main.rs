//! Red packet HTTP server

use anyhow::{Context, Result};
use packet_core::{Config, PacketEngine};
use packet_gateway::{init_tracing, router, AppState};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = load_config()?;
    init_tracing(&config.log_format);

    info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting packet server"
    );

    let engine = Arc::new(PacketEngine::open(config.clone()).context("failed to open engine")?);

    let token = CancellationToken::new();
    let background = engine.spawn_background(token.clone());

    let app = router(AppState::new(engine.clone()));
    let listener = TcpListener::bind(&config.http_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_listen_addr))?;
    info!(addr = %config.http_listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down packet server...");
    token.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown()?,
        Err(_) => warn!("Engine still shared at shutdown, skipping storage close"),
    }

    info!("Packet server stopped");
    Ok(())
}

/// `PACKET_CONFIG` names a TOML file; `PACKET_*` variables override it.
fn load_config() -> Result<Config> {
    let config = match std::env::var("PACKET_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path))?;
            config.apply_env()?;
            config
        }
        Err(_) => Config::from_env()?,
    };
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
