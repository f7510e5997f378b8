//! # Chain Polling Source
//!
//! Turns recent on-chain activity of the tracked wallets into transaction events.
//!
//! Each poll takes the next batch of wallets in round-robin order, lists their
//! latest signatures with `getSignaturesForAddress` and fetches the new ones with
//! `getTransaction`. The owner's balance change for the tracked mint, read from
//! the pre/post token balances, decides between buy and sell; the first account
//! key found in the protocol table names the protocol.
//!
//! Every wallet keeps its own cursor: the highest slot it produced an event at,
//! plus the signatures already emitted at that slot. Wallets polled in later
//! batches are therefore never held back by progress made on others.
//!
//! RPC failures are logged per wallet and never fail the poll.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::ingestors::{protocol_for_program, EventSource, UNKNOWN_PROTOCOL};
use crate::model::{ActionKind, TrackedWallet, TransactionEvent};
use crate::retrieve::solana::ParsedTransaction;
use crate::retrieve::RpcClient;

/// Wallets polled concurrently within one batch.
const CONCURRENCY: usize = 4;

/// Position reached in one wallet's signature history.
#[derive(Debug, Clone, Default)]
struct WalletCursor {
    last_slot: u64,
    /// Signatures already turned into events at `last_slot` or above.
    seen: HashSet<String>,
}

impl WalletCursor {
    /// Older slots are done; the seen set decides within the floor slot.
    fn is_new(&self, signature: &str, slot: u64) -> bool {
        slot >= self.last_slot && !self.seen.contains(signature)
    }

    fn advance(&mut self, events: &[&TransactionEvent]) {
        let Some(top) = events.iter().map(|e| e.slot).max() else {
            return;
        };
        if top > self.last_slot {
            self.last_slot = top;
            self.seen.clear();
        }
        let floor = self.last_slot;
        self.seen
            .extend(events.iter().filter(|e| e.slot >= floor).map(|e| e.signature.clone()));
    }
}

#[derive(Default)]
struct Cursor {
    next_wallet: usize,
    /// Highest slot seen over all wallets.
    last_slot: u64,
    wallets: HashMap<String, WalletCursor>,
}

pub struct ChainPollingSource {
    rpc: Arc<RpcClient>,
    batch_size: usize,
    signature_limit: usize,
    cursor: Mutex<Cursor>,
}

impl ChainPollingSource {
    pub fn new(rpc: Arc<RpcClient>, batch_size: usize, signature_limit: usize) -> Self {
        Self {
            rpc,
            batch_size: batch_size.max(1),
            signature_limit: signature_limit.max(1),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Highest slot turned into an event so far.
    pub fn last_processed_slot(&self) -> u64 {
        self.cursor().last_slot
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Picks the next batch in round-robin order, each wallet paired with a copy of
    /// its cursor. Cursors of wallets no longer tracked are dropped.
    fn next_batch(&self, wallets: &[TrackedWallet]) -> Vec<(String, WalletCursor)> {
        let mut cursor = self.cursor();
        let tracked: HashSet<&str> = wallets.iter().map(|w| w.address.as_str()).collect();
        cursor.wallets.retain(|address, _| tracked.contains(address.as_str()));

        let take = self.batch_size.min(wallets.len());
        let start = cursor.next_wallet % wallets.len();
        cursor.next_wallet = (start + take) % wallets.len();
        (0..take)
            .map(|i| {
                let address = wallets[(start + i) % wallets.len()].address.clone();
                let position = cursor.wallets.get(&address).cloned().unwrap_or_default();
                (address, position)
            })
            .collect()
    }

    fn record(&self, events: &[TransactionEvent]) {
        let mut cursor = self.cursor();
        let mut by_wallet: HashMap<&str, Vec<&TransactionEvent>> = HashMap::new();
        for event in events {
            by_wallet.entry(event.wallet.as_str()).or_default().push(event);
            cursor.last_slot = cursor.last_slot.max(event.slot);
        }
        for (wallet, found) in by_wallet {
            cursor.wallets.entry(wallet.to_string()).or_default().advance(&found);
        }
    }

    async fn poll_wallet(
        &self,
        address: String,
        position: WalletCursor,
        token_address: &str,
    ) -> (String, Result<Vec<TransactionEvent>, RpcError>) {
        let outcome = self.fetch_new(&address, &position, token_address).await;
        (address, outcome)
    }

    async fn fetch_new(
        &self,
        address: &str,
        position: &WalletCursor,
        token_address: &str,
    ) -> Result<Vec<TransactionEvent>, RpcError> {
        let signatures = self.rpc.get_signatures_for_address(address, self.signature_limit).await?;

        let mut events = Vec::new();
        for info in signatures {
            if info.err.is_some() || !position.is_new(&info.signature, info.slot) {
                continue;
            }
            let Some(tx) = self.rpc.get_transaction(&info.signature).await? else {
                debug!(signature = %info.signature, "Transaction not available yet");
                continue;
            };
            if let Some(event) = event_from_transaction(&info.signature, address, token_address, &tx) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Builds an event from a fetched transaction, or `None` when it did not move
/// the owner's balance of `token_address`.
pub fn event_from_transaction(
    signature: &str,
    owner: &str,
    token_address: &str,
    tx: &ParsedTransaction,
) -> Option<TransactionEvent> {
    if tx.meta.as_ref().is_some_and(|m| m.err.is_some()) {
        return None;
    }
    let delta = tx.token_delta(owner, token_address)?;
    let action_type = if delta.change > 0.0 {
        ActionKind::Buy
    } else if delta.change < 0.0 {
        ActionKind::Sell
    } else {
        return None;
    };

    let protocol = tx
        .account_keys()
        .find_map(protocol_for_program)
        .unwrap_or(UNKNOWN_PROTOCOL);
    let timestamp: DateTime<Utc> = tx
        .block_time
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    Some(TransactionEvent {
        signature: signature.to_string(),
        timestamp,
        wallet: owner.to_string(),
        token_address: token_address.to_string(),
        amount: delta.change.abs(),
        action_type,
        protocol: protocol.to_string(),
        block_time: timestamp.timestamp(),
        slot: tx.slot,
        from_address: None,
        to_address: None,
        pre_balance: Some(delta.pre),
        post_balance: Some(delta.post),
    })
}

#[async_trait]
impl EventSource for ChainPollingSource {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn poll(&self, wallets: &[TrackedWallet], token_address: &str) -> Result<Vec<TransactionEvent>, RpcError> {
        if wallets.is_empty() {
            return Ok(Vec::new());
        }
        let mut pending = Vec::new();
        for (address, position) in self.next_batch(wallets) {
            pending.push(self.poll_wallet(address, position, token_address));
        }
        let results: Vec<_> = stream::iter(pending).buffer_unordered(CONCURRENCY).collect().await;

        let mut events = Vec::new();
        for (wallet, outcome) in results {
            match outcome {
                Ok(mut found) => events.append(&mut found),
                Err(e) => warn!(wallet = %wallet, error = %e, "Polling wallet activity failed"),
            }
        }
        self.record(&events);

        // Oldest first so stored order follows the chain.
        events.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.signature.cmp(&b.signature)));
        events.dedup_by(|a, b| a.signature == b.signature);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::{RetryPolicy, RpcTransport};
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const MINT: &str = "MINT";
    const JUPITER: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";

    /// Answers by method name; records every request as `method:first_param`.
    #[derive(Default)]
    struct FakeChain {
        signatures: StdMutex<HashMap<String, Value>>,
        transactions: StdMutex<HashMap<String, Value>>,
        failing_wallets: Vec<String>,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeChain {
        /// Lists `(signature, slot)` for `wallet`, newest first as the node does,
        /// and makes each one a buy of `owner`.
        fn with_history(self, wallet: &str, history: &[(&str, u64)]) -> Self {
            self.set_history(wallet, history);
            self
        }

        fn set_history(&self, wallet: &str, history: &[(&str, u64)]) {
            let mut listed: Vec<_> = history.to_vec();
            listed.sort_by(|a, b| b.1.cmp(&a.1));
            let list: Vec<Value> = listed
                .iter()
                .map(|(sig, slot)| json!({"signature": sig, "slot": slot, "err": null}))
                .collect();
            self.signatures.lock().unwrap().insert(wallet.to_string(), Value::Array(list));
            let mut transactions = self.transactions.lock().unwrap();
            for (sig, slot) in history {
                transactions.insert(sig.to_string(), tx(*slot, wallet, "0", "100", JUPITER));
            }
        }

        fn fetched(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| c.strip_prefix("getTransaction:").map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl RpcTransport for FakeChain {
        async fn post(&self, body: &Value) -> Result<Value, RpcError> {
            let method = body["method"].as_str().unwrap_or_default().to_string();
            let key = body["params"][0].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(format!("{method}:{key}"));
            let result = match method.as_str() {
                "getSignaturesForAddress" => {
                    if self.failing_wallets.contains(&key) {
                        return Ok(json!({"error": {"code": -32005, "message": "node is behind"}}));
                    }
                    self.signatures.lock().unwrap().get(&key).cloned().unwrap_or(json!([]))
                }
                "getTransaction" => self.transactions.lock().unwrap().get(&key).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            };
            Ok(json!({"jsonrpc": "2.0", "id": body["id"], "result": result}))
        }
    }

    fn tx(slot: u64, owner: &str, pre: &str, post: &str, program: &str) -> Value {
        json!({
            "slot": slot,
            "blockTime": 1_700_000_000i64 + slot as i64,
            "meta": {
                "err": null,
                "preTokenBalances": [
                    {"mint": MINT, "owner": owner, "uiTokenAmount": {"amount": pre, "decimals": 2}}
                ],
                "postTokenBalances": [
                    {"mint": MINT, "owner": owner, "uiTokenAmount": {"amount": post, "decimals": 2}}
                ]
            },
            "transaction": {"message": {"accountKeys": [owner, program]}}
        })
    }

    fn source(chain: FakeChain, batch: usize) -> (ChainPollingSource, Arc<FakeChain>) {
        let chain = Arc::new(chain);
        let rpc = RpcClient::new(chain.clone(), RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(5)));
        (ChainPollingSource::new(Arc::new(rpc), batch, 10), chain)
    }

    fn wallets(names: &[&str]) -> Vec<TrackedWallet> {
        names.iter().map(|n| TrackedWallet::new(*n, None, Utc::now())).collect()
    }

    fn signatures(events: &[TransactionEvent]) -> Vec<&str> {
        events.iter().map(|e| e.signature.as_str()).collect()
    }

    #[tokio::test]
    async fn derives_buy_and_sell_from_balance_delta() {
        let chain = FakeChain::default();
        chain.signatures.lock().unwrap().insert(
            "w1".to_string(),
            json!([
                {"signature": "s2", "slot": 20, "err": null},
                {"signature": "s1", "slot": 10, "err": null},
                {"signature": "s0", "slot": 5, "err": {"InstructionError": [0, "Custom"]}}
            ]),
        );
        chain.transactions.lock().unwrap().extend([
            ("s1".to_string(), tx(10, "w1", "1000", "3500", JUPITER)),
            ("s2".to_string(), tx(20, "w1", "3500", "500", "11111111111111111111111111111111")),
        ]);
        let (source, _) = source(chain, 5);

        let events = source.poll(&wallets(&["w1"]), MINT).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].signature, "s1");
        assert_eq!(events[0].action_type, ActionKind::Buy);
        assert_eq!(events[0].amount, 25.0);
        assert_eq!(events[0].protocol, "Jupiter");
        assert_eq!(events[1].action_type, ActionKind::Sell);
        assert_eq!(events[1].amount, 30.0);
        assert_eq!(events[1].protocol, UNKNOWN_PROTOCOL);
        assert_eq!(source.last_processed_slot(), 20);

        // Nothing new on the second pass.
        assert!(source.poll(&wallets(&["w1"]), MINT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_wallet_does_not_hide_others() {
        let chain = FakeChain {
            failing_wallets: vec!["w1".to_string()],
            ..FakeChain::default()
        };
        chain.signatures.lock().unwrap().insert(
            "w2".to_string(),
            json!([{"signature": "s9", "slot": 9, "err": null}]),
        );
        chain.transactions.lock().unwrap().insert(
            "s9".to_string(),
            tx(9, "w2", "0", "100", "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc"),
        );
        let (source, _) = source(chain, 5);

        let events = source.poll(&wallets(&["w1", "w2"]), MINT).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].wallet, "w2");
        assert_eq!(events[0].protocol, "Orca");
    }

    #[tokio::test]
    async fn batches_round_robin_over_wallets() {
        let (source, chain) = source(FakeChain::default(), 2);
        let tracked = wallets(&["a", "b", "c"]);

        source.poll(&tracked, MINT).await.unwrap();
        source.poll(&tracked, MINT).await.unwrap();

        let mut calls = chain.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                "getSignaturesForAddress:a",
                "getSignaturesForAddress:a",
                "getSignaturesForAddress:b",
                "getSignaturesForAddress:c",
            ]
        );
    }

    #[tokio::test]
    async fn later_batch_wallet_is_not_held_back_by_higher_slots() {
        let chain = FakeChain::default()
            .with_history("a", &[("sa", 100)])
            .with_history("b", &[("sb", 50)]);
        let (source, _) = source(chain, 1);
        let tracked = wallets(&["a", "b"]);

        let first = source.poll(&tracked, MINT).await.unwrap();
        let second = source.poll(&tracked, MINT).await.unwrap();
        let third = source.poll(&tracked, MINT).await.unwrap();
        let fourth = source.poll(&tracked, MINT).await.unwrap();

        assert_eq!(signatures(&first), vec!["sa"]);
        assert_eq!(signatures(&second), vec!["sb"]);
        assert!(third.is_empty());
        assert!(fourth.is_empty());
        assert_eq!(source.last_processed_slot(), 100);
    }

    #[tokio::test]
    async fn signature_at_the_cursor_slot_is_emitted_once() {
        let chain = FakeChain::default().with_history("w", &[("s1", 10)]);
        let (source, chain) = source(chain, 5);
        let tracked = wallets(&["w"]);

        assert_eq!(signatures(&source.poll(&tracked, MINT).await.unwrap()), vec!["s1"]);

        // A second transaction lands in the same slot, then a newer one.
        chain.set_history("w", &[("s1", 10), ("s2", 10)]);
        assert_eq!(signatures(&source.poll(&tracked, MINT).await.unwrap()), vec!["s2"]);

        chain.set_history("w", &[("s1", 10), ("s2", 10), ("s3", 11)]);
        assert_eq!(signatures(&source.poll(&tracked, MINT).await.unwrap()), vec!["s3"]);
        assert!(source.poll(&tracked, MINT).await.unwrap().is_empty());

        assert_eq!(chain.fetched(), vec!["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn untracked_wallet_cursor_is_forgotten() {
        let chain = FakeChain::default().with_history("a", &[("sa", 7)]);
        let (source, _) = source(chain, 5);

        assert_eq!(source.poll(&wallets(&["a"]), MINT).await.unwrap().len(), 1);
        source.poll(&wallets(&["b"]), MINT).await.unwrap();
        // Tracked again: its history is read from scratch.
        assert_eq!(source.poll(&wallets(&["a"]), MINT).await.unwrap().len(), 1);
    }

    #[test]
    fn unchanged_balance_is_not_an_event() {
        let parsed: ParsedTransaction = serde_json::from_value(tx(3, "w", "100", "100", "x")).unwrap();
        assert!(event_from_transaction("s", "w", MINT, &parsed).is_none());
    }
}
