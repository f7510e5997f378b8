//! # TokenWise Server
//!
//! Serves the live wallet feed over a websocket at `/ws/transactions` and a
//! small REST surface under `/api`. Monitoring starts once at boot and stops
//! when the last websocket client leaves or the process shuts down.

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};

mod tokenwise_logic;
use tokenwise_logic::config::{self, ConfigSource, Settings};
use tokenwise_logic::{downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    // load .env before clap reads the environment
    dotenvy::dotenv().ok();

    let (raw_config, source) = config::load_config();
    let settings = Settings::try_from(raw_config)?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    match &source {
        ConfigSource::File(path) => info!("Loaded config file {}", path.display()),
        ConfigSource::Missing(path) => info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        ),
        ConfigSource::Unreadable(path, reason) => {
            warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), reason)
        }
    }
    if settings.token_defaulted {
        warn!(token = %settings.token_contract, "TOKEN_CONTRACT not set, using the default mint");
    }
    info!(
        port = settings.port,
        rpc_host = settings.rpc_url.host_str().unwrap_or("-"),
        token = %settings.token_contract,
        source = ?settings.event_source,
        "Starting TokenWise server"
    );

    let (app_state, lifecycle) = state::AppState::build(settings).await?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut downstream_handle = tokio::spawn(downstream::run(app_state.clone(), shutdown_tx.subscribe()));

    // Wait for shutdown signal, or the server dying on its own
    let server_exited = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
            false
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
            false
        }
        result = &mut downstream_handle => {
            match result {
                Ok(Ok(())) => warn!("Downstream server stopped unexpectedly."),
                Ok(Err(e)) => error!("Downstream server failed: {:#}", e),
                Err(e) => error!("Downstream server task failed: {}", e),
            }
            true
        }
    };

    // Stop accepting connections, then stop the monitor after its current cycle
    let _ = shutdown_tx.send(());
    if !server_exited {
        match downstream_handle.await {
            Ok(Err(e)) => error!("Downstream server failed during shutdown: {:#}", e),
            Err(e) => error!("Downstream server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    lifecycle.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
