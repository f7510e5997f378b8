//! # Store
//!
//! Typed persistence for wallets, transaction events and holder snapshots. The
//! engine only ever talks to `dyn Store`, so the in-memory and Postgres backends
//! are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    HolderSnapshot, HourlyProtocolCount, HourlyVolume, InsertOutcome, ProtocolCount, TrackedWallet, TransactionEvent,
    TransactionFilter, UpsertOutcome, VolumeSummary, WalletActivity, WalletVolume,
};

/// Persistence operations the engine and the query endpoints rely on.
///
/// Implementations must be safe for concurrent use; the monitor loop and request
/// handlers call into the same store in parallel.
#[async_trait]
pub trait Store: Send + Sync {
    /// Active wallets in tracking order, at most `limit`.
    async fn load_active_wallets(&self, limit: usize) -> Result<Vec<TrackedWallet>, StoreError>;

    async fn find_wallet(&self, address: &str) -> Result<Option<TrackedWallet>, StoreError>;

    /// Explicit track request: inserts the wallet, or reactivates an existing one.
    async fn track_wallet(&self, address: &str, now: DateTime<Utc>) -> Result<UpsertOutcome, StoreError>;

    /// Discovery write: inserts a new active wallet with `balance`, or updates only
    /// `balance`, `token_amount` and `last_updated` of an existing one.
    async fn upsert_holder_wallet(&self, address: &str, balance: f64, now: DateTime<Utc>)
        -> Result<UpsertOutcome, StoreError>;

    /// Bumps the buy/sell counter of `event.wallet` and records its timestamp as
    /// the last transaction. Unknown wallets are left alone.
    async fn apply_wallet_activity(&self, event: &TransactionEvent) -> Result<(), StoreError>;

    async fn count_active_wallets(&self) -> Result<u64, StoreError>;

    async fn find_snapshot(&self, token_address: &str) -> Result<Option<HolderSnapshot>, StoreError>;

    /// Replaces the snapshot for `snapshot.token_address` wholesale.
    async fn replace_snapshot(&self, snapshot: &HolderSnapshot) -> Result<(), StoreError>;

    /// Appends an event unless its signature is already stored.
    async fn insert_transaction(&self, event: &TransactionEvent) -> Result<InsertOutcome, StoreError>;

    /// Matching events, newest first.
    async fn recent_transactions(&self, filter: &TransactionFilter, limit: usize)
        -> Result<Vec<TransactionEvent>, StoreError>;

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64, StoreError>;

    /// Matching events grouped by protocol, most used first.
    async fn protocol_usage(&self, filter: &TransactionFilter, limit: usize) -> Result<Vec<ProtocolCount>, StoreError>;

    /// Wallets ranked by number of stored events.
    async fn most_active_wallets(&self, limit: usize) -> Result<Vec<WalletActivity>, StoreError>;

    async fn volume_since(&self, since: DateTime<Utc>) -> Result<VolumeSummary, StoreError>;

    async fn top_volume_wallets(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<WalletVolume>, StoreError>;

    /// Events since `since` counted per UTC hour and protocol, oldest hour first.
    async fn hourly_protocol_counts(&self, since: DateTime<Utc>) -> Result<Vec<HourlyProtocolCount>, StoreError>;

    /// Volume since `since` per UTC hour, oldest hour first.
    async fn hourly_volume(&self, since: DateTime<Utc>) -> Result<Vec<HourlyVolume>, StoreError>;
}
