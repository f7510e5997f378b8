//! Lifecycle controller: starts the monitor once, stops it when the last
//! subscriber leaves and again at shutdown.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::monitor::Monitor;
use crate::core::registry::RegistryEvent;

pub struct Lifecycle {
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
    watcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    /// Loads the tracked wallets, starts the monitor and begins watching the
    /// registry. A store failure during the initial load is logged; discovery
    /// fills the view later.
    pub async fn start(monitor: Arc<Monitor>) -> Self {
        match monitor.tracked().reload(monitor.store().as_ref()).await {
            Ok(count) => info!(tracked = count, "Loaded tracked wallets"),
            Err(e) => warn!(error = %e, "Initial wallet load failed, starting with an empty view"),
        }

        let mut events = monitor.registry().watch();
        monitor.start().await;

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Some(RegistryEvent::Drained) => {
                                // A subscriber may have joined since the signal.
                                if monitor.registry().is_empty() && monitor.stop().await {
                                    info!("No subscribers left, monitoring stopped");
                                }
                            }
                            None => break,
                        },
                    }
                }
            }
        });

        Self {
            monitor,
            cancel,
            watcher: tokio::sync::Mutex::new(Some(watcher)),
        }
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Stops watching the registry and stops the monitor, waiting for its
    /// in-flight cycle. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.lock().await.take() {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Registry watcher ended abnormally");
            }
        }
        self.monitor.stop().await;
        info!("Lifecycle shut down");
    }
}
