//! Records persisted by the `Store` and pushed to subscribers.
//!
//! Every entity is an explicit struct; backends validate on write and map
//! read-back failures to `StoreError::Corrupt` rather than passing loose
//! documents around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

/// Direction of an observed token movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Buy => "buy",
            ActionKind::Sell => "sell",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "buy" => Some(ActionKind::Buy),
            "sell" => Some(ActionKind::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A wallet whose activity is followed. Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedWallet {
    pub address: String,
    pub tracked_since: DateTime<Utc>,
    pub active: bool,
    /// Last known token balance.
    pub balance: Option<f64>,
    pub token_amount: Option<f64>,
    pub last_transaction: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_buys: u64,
    pub total_sells: u64,
    pub profit_loss: Option<f64>,
}

impl TrackedWallet {
    /// A freshly tracked, active wallet with zeroed counters.
    pub fn new(address: impl Into<String>, balance: Option<f64>, now: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            tracked_since: now,
            active: true,
            balance,
            token_amount: balance,
            last_transaction: None,
            last_updated: Some(now),
            total_buys: 0,
            total_sells: 0,
            profit_loss: None,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.address.trim().is_empty() {
            return Err(StoreError::Rejected("wallet address is empty".into()));
        }
        if self.balance.is_some_and(|b| !b.is_finite()) {
            return Err(StoreError::Rejected(format!("wallet {} has a non-finite balance", self.address)));
        }
        Ok(())
    }
}

/// One observed (or synthesized) token movement. Append-only; `signature` is the
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    pub wallet: String,
    pub token_address: String,
    pub amount: f64,
    pub action_type: ActionKind,
    pub protocol: String,
    pub block_time: i64,
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_balance: Option<f64>,
}

impl TransactionEvent {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.signature.is_empty() {
            return Err(StoreError::Rejected("transaction signature is empty".into()));
        }
        if self.wallet.is_empty() {
            return Err(StoreError::Rejected(format!("transaction {} has no wallet", self.signature)));
        }
        if !self.amount.is_finite() {
            return Err(StoreError::Rejected(format!("transaction {} has a non-finite amount", self.signature)));
        }
        Ok(())
    }
}

/// A ranked holder inside a `HolderSnapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenHolder {
    pub owner: String,
    /// First token account seen for this owner.
    pub address: String,
    pub balance: f64,
    pub ui_amount: f64,
    /// Derived at write time from `balance / total_supply`.
    pub percentage: f64,
    pub decimals: u8,
}

/// Top holders of one token. Replaced wholesale on every discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderSnapshot {
    pub token_address: String,
    pub holders: Vec<TokenHolder>,
    pub total_supply: f64,
    pub holder_count: usize,
    pub last_updated: DateTime<Utc>,
}

impl HolderSnapshot {
    pub fn new(token_address: impl Into<String>, holders: Vec<TokenHolder>, total_supply: f64, now: DateTime<Utc>) -> Self {
        Self {
            token_address: token_address.into(),
            holder_count: holders.len(),
            holders,
            total_supply,
            last_updated: now,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.token_address.is_empty() {
            return Err(StoreError::Rejected("snapshot token address is empty".into()));
        }
        if self.holder_count != self.holders.len() {
            return Err(StoreError::Rejected(format!(
                "snapshot for {} claims {} holders but carries {}",
                self.token_address,
                self.holder_count,
                self.holders.len()
            )));
        }
        Ok(())
    }
}

/// Percentage of supply held. A zero (or negative) supply yields zero.
pub fn share_of_supply(balance: f64, total_supply: f64) -> f64 {
    if total_supply > 0.0 {
        balance / total_supply * 100.0
    } else {
        0.0
    }
}

/// Events grouped by protocol. Serialized with the `_id` key dashboards expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCount {
    #[serde(rename = "_id")]
    pub protocol: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletActivity {
    pub wallet_address: String,
    pub tx_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletVolume {
    pub wallet_address: String,
    pub total_volume: f64,
    pub transaction_count: u64,
}

/// Events of one protocol within one UTC hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyProtocolCount {
    pub hour: DateTime<Utc>,
    pub protocol: String,
    pub count: u64,
}

/// Volume moved within one UTC hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyVolume {
    pub hour: DateTime<Utc>,
    pub volume: f64,
    pub transactions: u64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

/// Start of the UTC hour containing `at`.
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(at)
}

/// Narrows transaction queries. All fields are optional and combine with AND.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub wallet: Option<String>,
    pub action: Option<ActionKind>,
    pub since: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn wallet(address: impl Into<String>) -> Self {
        Self { wallet: Some(address.into()), ..Default::default() }
    }

    pub fn action(action: ActionKind) -> Self {
        Self { action: Some(action), ..Default::default() }
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self { since: Some(since), ..Default::default() }
    }

    pub fn matches(&self, event: &TransactionEvent) -> bool {
        self.wallet.as_deref().is_none_or(|w| w == event.wallet)
            && self.action.is_none_or(|a| a == event.action_type)
            && self.since.is_none_or(|s| event.timestamp >= s)
    }
}

/// Result of an idempotent insert keyed by a unique field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Result of an insert-or-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_supply_never_divides() {
        assert_eq!(share_of_supply(10.0, 0.0), 0.0);
        assert_eq!(share_of_supply(10.0, 100.0), 10.0);
    }

    #[test]
    fn protocol_count_uses_underscore_id() {
        let row = ProtocolCount { protocol: "Jupiter".into(), count: 3 };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json, serde_json::json!({ "_id": "Jupiter", "count": 3 }));
    }

    #[test]
    fn action_kind_round_trips_as_lowercase() {
        assert_eq!(serde_json::to_string(&ActionKind::Sell).unwrap(), "\"sell\"");
        assert_eq!(ActionKind::parse("buy"), Some(ActionKind::Buy));
        assert_eq!(ActionKind::parse("hold"), None);
    }

    #[test]
    fn filter_combines_fields() {
        let now = Utc::now();
        let event = TransactionEvent {
            signature: "sig".into(),
            timestamp: now,
            wallet: "w1".into(),
            token_address: "mint".into(),
            amount: 1.0,
            action_type: ActionKind::Buy,
            protocol: "Orca".into(),
            block_time: now.timestamp(),
            slot: 1,
            from_address: None,
            to_address: None,
            pre_balance: None,
            post_balance: None,
        };
        assert!(TransactionFilter::wallet("w1").matches(&event));
        assert!(!TransactionFilter::wallet("w2").matches(&event));
        assert!(!TransactionFilter::action(ActionKind::Sell).matches(&event));
        assert!(TransactionFilter::since(now - chrono::Duration::hours(1)).matches(&event));
    }

    #[test]
    fn snapshot_validation_checks_count() {
        let mut snap = HolderSnapshot::new("mint", Vec::new(), 0.0, Utc::now());
        assert!(snap.validate().is_ok());
        snap.holder_count = 4;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn hour_bucket_truncates_to_the_hour() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T13:59:59Z").unwrap().with_timezone(&Utc);
        let bucket = hour_bucket(at);
        assert_eq!(bucket.to_rfc3339(), "2024-05-01T13:00:00+00:00");
        assert_eq!(hour_bucket(bucket), bucket);
    }
}
