//! In-process `Store` backed by `tokio::sync::RwLock` guarded collections.
//!
//! Used when no database is configured and as the store in tests. Every
//! operation holds the lock only for its own synchronous body.
//!
//! Transactions are kept in arrival order up to a retention cap; the oldest rows
//! and their signatures are dropped first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::connections::store::Store;
use crate::error::StoreError;
use crate::model::{
    hour_bucket, ActionKind, HolderSnapshot, HourlyProtocolCount, HourlyVolume, InsertOutcome, ProtocolCount,
    TrackedWallet, TransactionEvent, TransactionFilter, UpsertOutcome, VolumeSummary, WalletActivity, WalletVolume,
};

/// Transactions kept by `MemoryStore::new`.
pub const DEFAULT_RETAINED_TRANSACTIONS: usize = 50_000;

#[derive(Default)]
struct Inner {
    /// Insertion order doubles as tracking order.
    wallets: Vec<TrackedWallet>,
    wallet_index: HashMap<String, usize>,
    snapshots: HashMap<String, HolderSnapshot>,
    transactions: VecDeque<TransactionEvent>,
    signatures: HashSet<String>,
}

impl Inner {
    fn wallet_mut(&mut self, address: &str) -> Option<&mut TrackedWallet> {
        let idx = *self.wallet_index.get(address)?;
        self.wallets.get_mut(idx)
    }

    fn push_wallet(&mut self, wallet: TrackedWallet) {
        self.wallet_index.insert(wallet.address.clone(), self.wallets.len());
        self.wallets.push(wallet);
    }

    /// Matching events, newest first; equal timestamps keep the later insert first.
    fn matching<'a>(&'a self, filter: &'a TransactionFilter) -> impl Iterator<Item = &'a TransactionEvent> + 'a {
        self.transactions.iter().rev().filter(move |e| filter.matches(e))
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    offline: AtomicBool,
    retained: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_TRANSACTIONS)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that keeps at most `retained` transactions.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            inner: RwLock::default(),
            offline: AtomicBool::new(false),
            retained: retained.max(1),
        }
    }

    /// While offline every operation fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

fn ranked<K: Ord>(mut rows: Vec<(K, u64)>, limit: usize) -> Vec<(K, u64)> {
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.truncate(limit);
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_active_wallets(&self, limit: usize) -> Result<Vec<TrackedWallet>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner.wallets.iter().filter(|w| w.active).take(limit).cloned().collect())
    }

    async fn find_wallet(&self, address: &str) -> Result<Option<TrackedWallet>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner.wallet_index.get(address).and_then(|&idx| inner.wallets.get(idx)).cloned())
    }

    async fn track_wallet(&self, address: &str, now: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        self.check_online()?;
        let fresh = TrackedWallet::new(address, None, now);
        fresh.validate()?;
        let mut inner = self.inner.write().await;
        match inner.wallet_mut(address) {
            Some(existing) => {
                existing.active = true;
                existing.last_updated = Some(now);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                inner.push_wallet(fresh);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn upsert_holder_wallet(
        &self,
        address: &str,
        balance: f64,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_online()?;
        let fresh = TrackedWallet::new(address, Some(balance), now);
        fresh.validate()?;
        let mut inner = self.inner.write().await;
        match inner.wallet_mut(address) {
            Some(existing) => {
                existing.balance = Some(balance);
                existing.token_amount = Some(balance);
                existing.last_updated = Some(now);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                inner.push_wallet(fresh);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn apply_wallet_activity(&self, event: &TransactionEvent) -> Result<(), StoreError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        if let Some(wallet) = inner.wallet_mut(&event.wallet) {
            match event.action_type {
                ActionKind::Buy => wallet.total_buys += 1,
                ActionKind::Sell => wallet.total_sells += 1,
            }
            wallet.last_transaction = Some(event.timestamp);
        }
        Ok(())
    }

    async fn count_active_wallets(&self) -> Result<u64, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner.wallets.iter().filter(|w| w.active).count() as u64)
    }

    async fn find_snapshot(&self, token_address: &str) -> Result<Option<HolderSnapshot>, StoreError> {
        self.check_online()?;
        Ok(self.inner.read().await.snapshots.get(token_address).cloned())
    }

    async fn replace_snapshot(&self, snapshot: &HolderSnapshot) -> Result<(), StoreError> {
        self.check_online()?;
        snapshot.validate()?;
        let mut inner = self.inner.write().await;
        inner.snapshots.insert(snapshot.token_address.clone(), snapshot.clone());
        Ok(())
    }

    async fn insert_transaction(&self, event: &TransactionEvent) -> Result<InsertOutcome, StoreError> {
        self.check_online()?;
        event.validate()?;
        let mut inner = self.inner.write().await;
        if !inner.signatures.insert(event.signature.clone()) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.transactions.push_back(event.clone());
        while inner.transactions.len() > self.retained {
            if let Some(dropped) = inner.transactions.pop_front() {
                inner.signatures.remove(&dropped.signature);
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn recent_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
    ) -> Result<Vec<TransactionEvent>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let mut events: Vec<TransactionEvent> = inner.matching(filter).cloned().collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64, StoreError> {
        self.check_online()?;
        Ok(self.inner.read().await.matching(filter).count() as u64)
    }

    async fn protocol_usage(&self, filter: &TransactionFilter, limit: usize) -> Result<Vec<ProtocolCount>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for event in inner.matching(filter) {
            *counts.entry(event.protocol.as_str()).or_default() += 1;
        }
        Ok(ranked(counts.into_iter().collect(), limit)
            .into_iter()
            .map(|(protocol, count)| ProtocolCount { protocol: protocol.to_string(), count })
            .collect())
    }

    async fn most_active_wallets(&self, limit: usize) -> Result<Vec<WalletActivity>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for event in &inner.transactions {
            *counts.entry(event.wallet.as_str()).or_default() += 1;
        }
        Ok(ranked(counts.into_iter().collect(), limit)
            .into_iter()
            .map(|(wallet, tx_count)| WalletActivity { wallet_address: wallet.to_string(), tx_count })
            .collect())
    }

    async fn volume_since(&self, since: DateTime<Utc>) -> Result<VolumeSummary, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let filter = TransactionFilter::since(since);
        let mut summary = VolumeSummary::default();
        for event in inner.matching(&filter) {
            summary.total_volume += event.amount;
            match event.action_type {
                ActionKind::Buy => summary.buy_volume += event.amount,
                ActionKind::Sell => summary.sell_volume += event.amount,
            }
            summary.transaction_count += 1;
        }
        Ok(summary)
    }

    async fn top_volume_wallets(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<WalletVolume>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let filter = TransactionFilter::since(since);
        let mut per_wallet: HashMap<&str, (f64, u64)> = HashMap::new();
        for event in inner.matching(&filter) {
            let entry = per_wallet.entry(event.wallet.as_str()).or_default();
            entry.0 += event.amount;
            entry.1 += 1;
        }
        let mut rows: Vec<WalletVolume> = per_wallet
            .into_iter()
            .map(|(wallet, (total_volume, transaction_count))| WalletVolume {
                wallet_address: wallet.to_string(),
                total_volume,
                transaction_count,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.total_volume
                .total_cmp(&a.total_volume)
                .then_with(|| a.wallet_address.cmp(&b.wallet_address))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn hourly_protocol_counts(&self, since: DateTime<Utc>) -> Result<Vec<HourlyProtocolCount>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let filter = TransactionFilter::since(since);
        let mut buckets: BTreeMap<(DateTime<Utc>, &str), u64> = BTreeMap::new();
        for event in inner.matching(&filter) {
            *buckets.entry((hour_bucket(event.timestamp), event.protocol.as_str())).or_default() += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|((hour, protocol), count)| HourlyProtocolCount { hour, protocol: protocol.to_string(), count })
            .collect())
    }

    async fn hourly_volume(&self, since: DateTime<Utc>) -> Result<Vec<HourlyVolume>, StoreError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        let filter = TransactionFilter::since(since);
        let mut buckets: BTreeMap<DateTime<Utc>, HourlyVolume> = BTreeMap::new();
        for event in inner.matching(&filter) {
            let hour = hour_bucket(event.timestamp);
            let bucket = buckets.entry(hour).or_insert_with(|| HourlyVolume {
                hour,
                volume: 0.0,
                transactions: 0,
                buy_volume: 0.0,
                sell_volume: 0.0,
            });
            bucket.volume += event.amount;
            bucket.transactions += 1;
            match event.action_type {
                ActionKind::Buy => bucket.buy_volume += event.amount,
                ActionKind::Sell => bucket.sell_volume += event.amount,
            }
        }
        Ok(buckets.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(signature: &str, wallet: &str, action: ActionKind, amount: f64, at: DateTime<Utc>) -> TransactionEvent {
        TransactionEvent {
            signature: signature.into(),
            timestamp: at,
            wallet: wallet.into(),
            token_address: "mint".into(),
            amount,
            action_type: action,
            protocol: if action == ActionKind::Buy { "Jupiter".into() } else { "Orca".into() },
            block_time: at.timestamp(),
            slot: 1,
            from_address: None,
            to_address: None,
            pre_balance: None,
            post_balance: None,
        }
    }

    #[tokio::test]
    async fn same_signature_is_stored_once() {
        let store = MemoryStore::new();
        let e = event("sig-1", "w1", ActionKind::Buy, 5.0, Utc::now());

        assert_eq!(store.insert_transaction(&e).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_transaction(&e).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count_transactions(&TransactionFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn holder_upsert_preserves_counters_and_flag() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        assert_eq!(store.upsert_holder_wallet("w1", 100.0, t0).await.unwrap(), UpsertOutcome::Inserted);
        store.apply_wallet_activity(&event("s", "w1", ActionKind::Sell, 1.0, t0)).await.unwrap();

        let t1 = t0 + Duration::minutes(5);
        assert_eq!(store.upsert_holder_wallet("w1", 250.0, t1).await.unwrap(), UpsertOutcome::Updated);

        let wallet = store.find_wallet("w1").await.unwrap().unwrap();
        assert_eq!(wallet.balance, Some(250.0));
        assert_eq!(wallet.token_amount, Some(250.0));
        assert_eq!(wallet.last_updated, Some(t1));
        assert_eq!(wallet.tracked_since, t0);
        assert_eq!(wallet.total_sells, 1);
        assert!(wallet.active);
    }

    #[tokio::test]
    async fn track_request_reactivates() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.track_wallet("w1", now).await.unwrap();
        store.inner.write().await.wallet_mut("w1").unwrap().active = false;
        assert_eq!(store.count_active_wallets().await.unwrap(), 0);

        assert_eq!(store.track_wallet("w1", now).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.count_active_wallets().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_filtered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_transaction(&event("a", "w1", ActionKind::Buy, 1.0, now - Duration::minutes(2))).await.unwrap();
        store.insert_transaction(&event("b", "w2", ActionKind::Sell, 2.0, now)).await.unwrap();
        store.insert_transaction(&event("c", "w1", ActionKind::Sell, 3.0, now - Duration::minutes(1))).await.unwrap();

        let all = store.recent_transactions(&TransactionFilter::default(), 10).await.unwrap();
        let sigs: Vec<_> = all.iter().map(|e| e.signature.as_str()).collect();
        assert_eq!(sigs, vec!["b", "c", "a"]);

        let w1 = store.recent_transactions(&TransactionFilter::wallet("w1"), 1).await.unwrap();
        assert_eq!(w1.len(), 1);
        assert_eq!(w1[0].signature, "c");

        let sells = store.count_transactions(&TransactionFilter::action(ActionKind::Sell)).await.unwrap();
        assert_eq!(sells, 2);
    }

    #[tokio::test]
    async fn aggregates_rank_by_count_and_volume() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_transaction(&event("1", "w1", ActionKind::Buy, 10.0, now)).await.unwrap();
        store.insert_transaction(&event("2", "w1", ActionKind::Buy, 5.0, now)).await.unwrap();
        store.insert_transaction(&event("3", "w2", ActionKind::Sell, 40.0, now)).await.unwrap();
        store.insert_transaction(&event("4", "w2", ActionKind::Sell, 1.0, now - Duration::days(2))).await.unwrap();

        let protocols = store.protocol_usage(&TransactionFilter::default(), 10).await.unwrap();
        assert_eq!(protocols[0].count, 2);
        assert_eq!(protocols.len(), 2);

        let active = store.most_active_wallets(1).await.unwrap();
        assert_eq!(active, vec![WalletActivity { wallet_address: "w1".into(), tx_count: 2 }]);

        let since = now - Duration::days(1);
        let volume = store.volume_since(since).await.unwrap();
        assert_eq!(volume.total_volume, 55.0);
        assert_eq!(volume.buy_volume, 15.0);
        assert_eq!(volume.sell_volume, 40.0);
        assert_eq!(volume.transaction_count, 3);

        let top = store.top_volume_wallets(since, 20).await.unwrap();
        assert_eq!(top[0].wallet_address, "w2");
        assert_eq!(top[0].total_volume, 40.0);
        assert_eq!(top[1].transaction_count, 2);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.count_active_wallets().await, Err(StoreError::Unavailable(_))));
        store.set_offline(false);
        assert_eq!(store.count_active_wallets().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_event_is_rejected() {
        let store = MemoryStore::new();
        let e = event("", "w1", ActionKind::Buy, 1.0, Utc::now());
        assert!(matches!(store.insert_transaction(&e).await, Err(StoreError::Rejected(_))));
    }

    #[tokio::test]
    async fn oldest_transactions_are_dropped_past_retention() {
        let store = MemoryStore::with_retention(3);
        let now = Utc::now();
        for (i, sig) in ["a", "b", "c", "d"].iter().enumerate() {
            let at = now + Duration::seconds(i as i64);
            store.insert_transaction(&event(sig, "w1", ActionKind::Buy, 1.0, at)).await.unwrap();
        }

        assert_eq!(store.count_transactions(&TransactionFilter::default()).await.unwrap(), 3);
        let recent = store.recent_transactions(&TransactionFilter::default(), 10).await.unwrap();
        let sigs: Vec<_> = recent.iter().map(|e| e.signature.as_str()).collect();
        assert_eq!(sigs, vec!["d", "c", "b"]);
        // Still deduplicated within the retained window.
        let again = event("d", "w1", ActionKind::Buy, 1.0, now);
        assert_eq!(store.insert_transaction(&again).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn hourly_aggregates_bucket_by_utc_hour() {
        let store = MemoryStore::new();
        let hour = hour_bucket(Utc::now()) - Duration::hours(2);
        store.insert_transaction(&event("1", "w1", ActionKind::Buy, 10.0, hour + Duration::minutes(5))).await.unwrap();
        store.insert_transaction(&event("2", "w2", ActionKind::Sell, 4.0, hour + Duration::minutes(50))).await.unwrap();
        store.insert_transaction(&event("3", "w1", ActionKind::Buy, 1.0, hour + Duration::minutes(65))).await.unwrap();
        store.insert_transaction(&event("4", "w1", ActionKind::Buy, 99.0, hour - Duration::days(2))).await.unwrap();

        let since = hour - Duration::hours(1);
        let volume = store.hourly_volume(since).await.unwrap();
        assert_eq!(volume.len(), 2);
        assert_eq!(volume[0].hour, hour);
        assert_eq!(volume[0].volume, 14.0);
        assert_eq!(volume[0].transactions, 2);
        assert_eq!(volume[0].buy_volume, 10.0);
        assert_eq!(volume[0].sell_volume, 4.0);
        assert_eq!(volume[1].hour, hour + Duration::hours(1));
        assert_eq!(volume[1].volume, 1.0);

        let protocols = store.hourly_protocol_counts(since).await.unwrap();
        let rows: Vec<_> = protocols.iter().map(|r| (r.hour, r.protocol.as_str(), r.count)).collect();
        assert_eq!(
            rows,
            vec![
                (hour, "Jupiter", 1),
                (hour, "Orca", 1),
                (hour + Duration::hours(1), "Jupiter", 1),
            ]
        );
    }
}
