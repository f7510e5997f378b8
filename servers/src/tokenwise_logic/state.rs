use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use lib_tokenwise::connections::PgStore;
use lib_tokenwise::core::TrackedSet;
use lib_tokenwise::ingestors::{ChainPollingSource, EventSource, SyntheticEventSource};
use lib_tokenwise::{
    Discovery, Lifecycle, MemoryStore, Monitor, MonitorSettings, RetryPolicy, RpcClient, Store, SubscriberRegistry,
};

use crate::tokenwise_logic::config::{EventSourceKind, Settings};

/// Wallets polled per cycle by the chain source.
const CHAIN_BATCH_SIZE: usize = 10;
/// Signatures requested per wallet by the chain source.
const CHAIN_SIGNATURE_LIMIT: usize = 20;

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    settings: Arc<Settings>,
    monitor: Arc<Monitor>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, monitor: Arc<Monitor>) -> Self {
        Self { settings, monitor }
    }

    /// Connects the store, builds the engine and starts monitoring. The caller
    /// owns the returned lifecycle and shuts it down on exit.
    pub async fn build(settings: Settings) -> Result<(Self, Lifecycle)> {
        let store: Arc<dyn Store> = match settings.database_url.as_deref() {
            Some(url) => {
                let store = PgStore::connect(url, settings.db_pool_size)
                    .await
                    .context("Failed to connect to Postgres")?;
                info!(pool_size = settings.db_pool_size, "Using Postgres store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let policy = RetryPolicy::new(settings.rpc_max_retries, settings.rpc_initial_backoff, settings.rpc_timeout);
        let rpc = Arc::new(RpcClient::http(settings.rpc_url.as_str(), policy).context("Failed to build RPC client")?);

        let source: Arc<dyn EventSource> = match settings.event_source {
            EventSourceKind::Synthetic => Arc::new(SyntheticEventSource::new()),
            EventSourceKind::Chain => Arc::new(ChainPollingSource::new(
                Arc::clone(&rpc),
                CHAIN_BATCH_SIZE,
                CHAIN_SIGNATURE_LIMIT,
            )),
        };
        info!(source = source.name(), "Event source selected");

        let discovery = Arc::new(Discovery::new(rpc, Arc::clone(&store), Arc::new(TrackedSet::new())));
        let monitor_settings = MonitorSettings {
            token_address: settings.token_contract.clone(),
            top_n: settings.top_n,
            cycle_period: settings.cycle_period,
            discovery_interval: settings.discovery_interval,
        };
        let monitor = Arc::new(Monitor::new(
            monitor_settings,
            store,
            Arc::new(SubscriberRegistry::new()),
            discovery,
            source,
        ));

        let lifecycle = Lifecycle::start(Arc::clone(&monitor)).await;
        Ok((Self::new(Arc::new(settings), monitor), lifecycle))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.monitor().registry()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.monitor().store()
    }

    pub fn tracked(&self) -> &Arc<TrackedSet> {
        self.monitor().tracked()
    }

    pub fn token(&self) -> &str {
        &self.settings.token_contract
    }
}

/// Engine wiring for handler tests: an in-memory store, an RPC transport that is
/// always offline and a monitor that is never started.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use lib_tokenwise::retrieve::RpcTransport;
    use lib_tokenwise::RpcError;
    use serde_json::Value;

    use crate::tokenwise_logic::config::Config;

    struct Offline;

    #[async_trait]
    impl RpcTransport for Offline {
        async fn post(&self, _body: &Value) -> Result<Value, RpcError> {
            Err(RpcError::Transport("offline".to_string()))
        }
    }

    pub fn settings() -> Settings {
        Settings::try_from(Config {
            rpc_url: Some("http://127.0.0.1:8899".to_string()),
            token_contract: Some("mint".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    pub fn app(store: Arc<MemoryStore>) -> AppState {
        let rpc = Arc::new(RpcClient::new(Arc::new(Offline), RetryPolicy::default()));
        let discovery = Arc::new(Discovery::new(rpc, store.clone(), Arc::new(TrackedSet::new())));
        let monitor = Monitor::new(
            MonitorSettings::new("mint"),
            store,
            Arc::new(SubscriberRegistry::new()),
            discovery,
            Arc::new(SyntheticEventSource::new()),
        );
        AppState::new(Arc::new(settings()), Arc::new(monitor))
    }
}
