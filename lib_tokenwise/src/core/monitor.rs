//! # Monitor Loop
//!
//! The coordinator. While running it repeats one cycle per period:
//!
//! 1. Run discovery when the long discovery interval has elapsed.
//! 2. Poll the event source for the tracked wallets, store new events and push
//!    each one to subscribers as `new_transaction`.
//! 3. Build the dashboard snapshot from the store.
//! 4. Broadcast it.
//!
//! Errors inside a cycle are logged and the next cycle runs on schedule. `stop`
//! cancels the wait between cycles and waits for an in-flight cycle to finish,
//! so a cycle is never cut off halfway through its store writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connections::Store;
use crate::core::dashboard::{build_dashboard, LiveCounters};
use crate::core::discovery::{Discovery, DiscoveryOutcome, TrackedSet};
use crate::core::registry::{encode_frame, BroadcastReport, SubscriberRegistry};
use crate::ingestors::EventSource;
use crate::model::{InsertOutcome, TransactionEvent};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Mint whose holders are tracked.
    pub token_address: String,
    pub top_n: usize,
    pub cycle_period: Duration,
    pub discovery_interval: Duration,
}

impl MonitorSettings {
    pub fn new(token_address: impl Into<String>) -> Self {
        Self {
            token_address: token_address.into(),
            top_n: 100,
            cycle_period: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Whether a discovery pass is due at `now`.
pub fn discovery_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        None => true,
        // A clock that moved backwards counts as "not yet".
        Some(last) => (now - last).to_std().is_ok_and(|elapsed| elapsed >= interval),
    }
}

/// Process-wide monitor bookkeeping, readable by request handlers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorState {
    pub running: bool,
    pub last_discovery: Option<DateTime<Utc>>,
    pub discovery_interval_secs: u64,
    pub last_processed_slot: u64,
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub discovery: Option<DiscoveryOutcome>,
    pub stored: usize,
    pub duplicates: usize,
    pub dashboard: Option<BroadcastReport>,
}

#[derive(Serialize)]
struct NewTransaction<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a TransactionEvent,
    timestamp: DateTime<Utc>,
}

struct Engine {
    settings: MonitorSettings,
    store: Arc<dyn Store>,
    registry: Arc<SubscriberRegistry>,
    discovery: Arc<Discovery>,
    source: Arc<dyn EventSource>,
    running: AtomicBool,
    last_discovery: Mutex<Option<DateTime<Utc>>>,
    last_processed_slot: Mutex<u64>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningLoop {
    async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Monitor task ended abnormally");
        }
    }
}

/// Clears the running flag when the loop exits, panics included.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Monitor {
    engine: Arc<Engine>,
    task: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        store: Arc<dyn Store>,
        registry: Arc<SubscriberRegistry>,
        discovery: Arc<Discovery>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                settings,
                store,
                registry,
                discovery,
                source,
                running: AtomicBool::new(false),
                last_discovery: Mutex::new(None),
                last_processed_slot: Mutex::new(0),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.engine.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.engine.store
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.engine.registry
    }

    pub fn tracked(&self) -> &Arc<TrackedSet> {
        self.engine.discovery.tracked()
    }

    pub fn is_running(&self) -> bool {
        self.engine.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MonitorState {
        MonitorState {
            running: self.is_running(),
            last_discovery: *lock(&self.engine.last_discovery),
            discovery_interval_secs: self.engine.settings.discovery_interval.as_secs(),
            last_processed_slot: *lock(&self.engine.last_processed_slot),
        }
    }

    /// Overrides the recorded discovery time, e.g. after a manual discovery.
    pub fn set_last_discovery(&self, at: Option<DateTime<Utc>>) {
        *lock(&self.engine.last_discovery) = at;
    }

    /// Spawns the loop. Returns `false` without doing anything if it already runs.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            debug!("Monitor already running");
            return false;
        }
        if let Some(ended) = task.take() {
            ended.join().await;
        }

        let cancel = CancellationToken::new();
        self.engine.running.store(true, Ordering::SeqCst);
        let engine = Arc::clone(&self.engine);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { engine.run(token).await });
        *task = Some(RunningLoop { cancel, handle });
        info!(
            token = %self.engine.settings.token_address,
            period_ms = self.engine.settings.cycle_period.as_millis() as u64,
            "Monitoring started"
        );
        true
    }

    /// Cancels the loop and waits for the current cycle to finish. Returns `false`
    /// if the loop was not running.
    pub async fn stop(&self) -> bool {
        // The lock is held until the old loop has exited so a concurrent `start`
        // cannot overlap with it.
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return false;
        };
        running.cancel.cancel();
        running.join().await;
        self.engine.running.store(false, Ordering::SeqCst);
        info!("Monitoring stopped");
        true
    }

    /// Runs a single cycle on the caller's task.
    pub async fn run_cycle(&self) -> CycleReport {
        self.engine.cycle().await
    }
}

impl Engine {
    async fn run(&self, cancel: CancellationToken) {
        let _running = RunningFlag(&self.running);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.cycle().await;
            debug!(
                stored = report.stored,
                duplicates = report.duplicates,
                delivered = report.dashboard.as_ref().map(|r| r.delivered).unwrap_or(0),
                "Monitor cycle complete"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.cycle_period) => {}
            }
        }
    }

    async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let token = self.settings.token_address.as_str();

        // 1. Discovery on its own long interval.
        let now = Utc::now();
        let last = *lock(&self.last_discovery);
        if discovery_due(last, now, self.settings.discovery_interval) {
            info!("Scheduled holder discovery");
            report.discovery = Some(self.discovery.discover(token, self.settings.top_n).await);
            *lock(&self.last_discovery) = Some(now);
        }

        // 2. New events for the tracked wallets.
        let tracked = self.discovery.tracked().snapshot();
        if !tracked.is_empty() {
            match self.source.poll(&tracked, token).await {
                Ok(events) => {
                    for event in events {
                        self.ingest(&event, &mut report).await;
                    }
                }
                Err(e) => warn!(source = self.source.name(), error = %e, "Event source poll failed"),
            }
        }

        // 3 + 4. Dashboard.
        let live = LiveCounters {
            monitoring_active: self.running.load(Ordering::SeqCst),
            connected_clients: self.registry.len(),
            tracked_wallets: tracked.len(),
        };
        match build_dashboard(self.store.as_ref(), token, live).await {
            Ok(update) => match encode_frame(&update) {
                Ok(frame) => report.dashboard = Some(self.registry.broadcast(frame)),
                Err(e) => error!(error = %e, "Failed to encode dashboard update"),
            },
            Err(e) => error!(error = %e, "Failed to build dashboard update"),
        }

        report
    }

    async fn ingest(&self, event: &TransactionEvent, report: &mut CycleReport) {
        match self.store.insert_transaction(event).await {
            Ok(InsertOutcome::Inserted) => {
                report.stored += 1;
                info!(
                    wallet = %event.wallet,
                    action = %event.action_type,
                    amount = event.amount,
                    protocol = %event.protocol,
                    "Stored transaction"
                );
                if let Err(e) = self.store.apply_wallet_activity(event).await {
                    warn!(wallet = %event.wallet, error = %e, "Failed to update wallet activity");
                }
                {
                    let mut slot = lock(&self.last_processed_slot);
                    *slot = (*slot).max(event.slot);
                }
                let message = NewTransaction {
                    kind: "new_transaction",
                    data: event,
                    timestamp: Utc::now(),
                };
                match encode_frame(&message) {
                    Ok(frame) => {
                        self.registry.broadcast(frame);
                    }
                    Err(e) => error!(error = %e, "Failed to encode transaction"),
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                report.duplicates += 1;
                debug!(signature = %event.signature, "Duplicate transaction ignored");
            }
            Err(e) => error!(signature = %event.signature, error = %e, "Failed to store transaction"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
