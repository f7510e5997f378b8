//! Synthetic event source.
//!
//! Emits one random buy or sell per poll for a uniformly chosen tracked wallet.
//! Nothing here touches the network.

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::IndexedRandom;
use rand::Rng;

use crate::error::RpcError;
use crate::ingestors::{protocol_labels, EventSource};
use crate::model::{ActionKind, TrackedWallet, TransactionEvent};

const MIN_AMOUNT: f64 = 10.0;
const MAX_AMOUNT: f64 = 1000.0;
const SLOT_RANGE: std::ops::Range<u64> = 100_000_000..200_000_000;

pub struct SyntheticEventSource {
    labels: Vec<&'static str>,
}

impl Default for SyntheticEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEventSource {
    pub fn new() -> Self {
        Self { labels: protocol_labels() }
    }

    fn generate(&self, wallets: &[TrackedWallet], token_address: &str) -> Option<TransactionEvent> {
        let mut rng = rand::rng();
        let wallet = wallets.choose(&mut rng)?;
        let protocol = self.labels.choose(&mut rng).copied().unwrap_or(crate::ingestors::UNKNOWN_PROTOCOL);
        let action_type = if rng.random_bool(0.5) { ActionKind::Buy } else { ActionKind::Sell };
        let amount = (rng.random_range(MIN_AMOUNT..MAX_AMOUNT) * 10_000.0).round() / 10_000.0;
        let now = Utc::now();

        Some(TransactionEvent {
            signature: format!("{}{}", uuid::Uuid::new_v4().simple(), now.timestamp()),
            timestamp: now,
            wallet: wallet.address.clone(),
            token_address: token_address.to_string(),
            amount,
            action_type,
            protocol: protocol.to_string(),
            block_time: now.timestamp(),
            slot: rng.random_range(SLOT_RANGE),
            from_address: None,
            to_address: None,
            pre_balance: None,
            post_balance: None,
        })
    }
}

#[async_trait]
impl EventSource for SyntheticEventSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn poll(&self, wallets: &[TrackedWallet], token_address: &str) -> Result<Vec<TransactionEvent>, RpcError> {
        Ok(self.generate(wallets, token_address).into_iter().collect())
    }
}
