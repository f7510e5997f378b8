//! Dashboard snapshot pushed to every subscriber at the end of a monitor cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connections::Store;
use crate::error::StoreError;
use crate::model::{ProtocolCount, TokenHolder, TransactionEvent, TransactionFilter, WalletActivity};

pub const TOP_HOLDERS: usize = 10;
pub const RECENT_TRANSACTIONS: usize = 20;
pub const PROTOCOL_ROWS: usize = 10;
pub const ACTIVE_WALLET_ROWS: usize = 10;

/// Live engine figures that do not come from the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveCounters {
    pub monitoring_active: bool,
    pub connected_clients: usize,
    pub tracked_wallets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub monitoring_active: bool,
    pub connected_clients: usize,
    pub tracked_wallets_count: usize,
    pub top_holders: Vec<TokenHolder>,
    pub recent_transactions: Vec<TransactionEvent>,
    pub protocol_usage: Vec<ProtocolCount>,
    pub most_active_wallets: Vec<WalletActivity>,
    /// Holders in the stored snapshot, not just the ones listed above.
    pub holder_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Reads everything the dashboard shows for `token_address`.
pub async fn build_dashboard(
    store: &dyn Store,
    token_address: &str,
    live: LiveCounters,
) -> Result<DashboardUpdate, StoreError> {
    let (top_holders, holder_count) = match store.find_snapshot(token_address).await? {
        Some(snapshot) => {
            let count = snapshot.holder_count;
            (snapshot.holders.into_iter().take(TOP_HOLDERS).collect(), count)
        }
        None => (Vec::new(), 0),
    };

    let everything = TransactionFilter::default();
    let recent_transactions = store.recent_transactions(&everything, RECENT_TRANSACTIONS).await?;
    let protocol_usage = store.protocol_usage(&everything, PROTOCOL_ROWS).await?;
    let most_active_wallets = store.most_active_wallets(ACTIVE_WALLET_ROWS).await?;

    Ok(DashboardUpdate {
        kind: "dashboard_update",
        monitoring_active: live.monitoring_active,
        connected_clients: live.connected_clients,
        tracked_wallets_count: live.tracked_wallets,
        top_holders,
        recent_transactions,
        protocol_usage,
        most_active_wallets,
        holder_count,
        timestamp: Utc::now(),
    })
}
