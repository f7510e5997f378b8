//! # Event Ingestors
//!
//! The monitor loop asks an `EventSource` for new transaction events once per
//! cycle and does not care where they come from.
//!
//! - **`synthetic`**: random events over the tracked wallets, for demos and tests.
//! - **`chain_polling`**: polls recent signatures of the tracked wallets and
//!   derives events from their token balance changes.
//!
//! This file also carries the program id → protocol label table both sources use.

pub mod chain_polling;
pub mod synthetic;

use async_trait::async_trait;

use crate::error::RpcError;
use crate::model::{TrackedWallet, TransactionEvent};

pub use chain_polling::ChainPollingSource;
pub use synthetic::SyntheticEventSource;

/// Produces transaction events for the tracked wallets.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Events observed since the previous call. `wallets` is never empty.
    async fn poll(&self, wallets: &[TrackedWallet], token_address: &str) -> Result<Vec<TransactionEvent>, RpcError>;
}

/// Known DEX program ids and the label shown for them.
pub const PROTOCOL_PROGRAM_IDS: &[(&str, &str)] = &[
    ("JUP4Fb2cqiRUcaTHdrPC8h2gNsA2ETXiPDD33WcGuJB", "Jupiter"),
    ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "Jupiter"),
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "Raydium"),
    ("5quBtoiQqxF9Jv6KYKctB59NT3gtJD2Y65kdnB1Uev3h", "Raydium"),
    ("27haf8L6oxUeXrHrgEgsexjSY5hbVUWEmvv9Nyxg8vQv", "Raydium"),
    ("9W959DqEETiGZocYWCQPaJ6sBmUzgfxXfqGeTEdp3aQP", "Orca"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "Orca"),
    ("DjVE6JNiYqPL2QXyCUUh8rNjHrbz9hXHNYt99MQ59qw1", "Orca"),
    ("SwaPpA9LAaLfeLi3a68M4DjnLqgtticKg6CnyNwgAC8", "Saber"),
    ("22Y43yTVxuUkoRKdm9thyRhQ3SdgQS7c7kB6UNCiaczD", "Serum"),
    ("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin", "Serum"),
];

/// Label for events whose program is not in the table.
pub const UNKNOWN_PROTOCOL: &str = "Unknown";

pub fn protocol_for_program(program_id: &str) -> Option<&'static str> {
    PROTOCOL_PROGRAM_IDS
        .iter()
        .find(|(id, _)| *id == program_id)
        .map(|(_, label)| *label)
}

/// Distinct labels in table order.
pub fn protocol_labels() -> Vec<&'static str> {
    let mut labels: Vec<&'static str> = Vec::new();
    for &(_, label) in PROTOCOL_PROGRAM_IDS {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}
