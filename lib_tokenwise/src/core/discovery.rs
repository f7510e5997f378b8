//! # Discovery
//!
//! Finds the current top holders of the tracked token and reconciles the tracked
//! wallet set with them.
//!
//! 1. `getProgramAccounts` for the mint. An empty answer is a no-op.
//! 2. `getAccountInfo` for supply and decimals.
//! 3. Raw balances are summed per owner, scaled by `10^decimals`, ranked with a
//!    stable descending sort and cut to `top_n`.
//! 4. Each holder is upserted as a tracked wallet, the in-memory tracked view is
//!    reloaded and the holder snapshot is replaced last.
//!
//! A failure in steps 1-2 writes nothing. A failed upsert leaves the previous
//! snapshot in place. Errors never leave `discover`; they
//! are logged and reported through `DiscoveryOutcome`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::connections::Store;
use crate::error::{RpcError, StoreError};
use crate::model::{share_of_supply, HolderSnapshot, TokenHolder, TrackedWallet, UpsertOutcome};
use crate::retrieve::solana::{to_ui_amount, MintInfo, TokenAccount};
use crate::retrieve::RpcClient;

/// Upper bound on wallets loaded into the tracked view.
pub const TRACKED_WALLET_LIMIT: usize = 1000;

/// Ranks owners by their summed raw balance, largest first, keeping at most `top_n`.
///
/// Owners appear in the order their first account was seen, so equal balances keep
/// input order. Zero balances are dropped. Percentages derive from the mint's UI
/// supply and are zero when the supply is zero.
pub fn rank_holders(accounts: &[TokenAccount], mint: &MintInfo, top_n: usize) -> Vec<TokenHolder> {
    struct Owner<'a> {
        owner: &'a str,
        first_account: &'a str,
        raw: u128,
    }

    let mut owners: Vec<Owner<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for account in accounts {
        if account.owner.is_empty() {
            continue;
        }
        match index.get(account.owner.as_str()) {
            Some(&i) => owners[i].raw = owners[i].raw.saturating_add(account.amount),
            None => {
                index.insert(&account.owner, owners.len());
                owners.push(Owner {
                    owner: &account.owner,
                    first_account: &account.pubkey,
                    raw: account.amount,
                });
            }
        }
    }

    owners.retain(|o| o.raw > 0);
    owners.sort_by(|a, b| b.raw.cmp(&a.raw));
    owners.truncate(top_n);

    let total_supply = mint.ui_supply();
    owners
        .into_iter()
        .map(|o| {
            let balance = to_ui_amount(o.raw, mint.decimals);
            TokenHolder {
                owner: o.owner.to_string(),
                address: o.first_account.to_string(),
                balance,
                ui_amount: balance,
                percentage: share_of_supply(balance, total_supply),
                decimals: mint.decimals,
            }
        })
        .collect()
}

/// In-memory view of the active tracked wallets, shared by the monitor loop and
/// the request handlers. Readers get a cheap snapshot.
#[derive(Default)]
pub struct TrackedSet {
    wallets: RwLock<Arc<Vec<TrackedWallet>>>,
}

impl TrackedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<TrackedWallet>> {
        match self.wallets.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn replace(&self, wallets: Vec<TrackedWallet>) {
        let fresh = Arc::new(wallets);
        match self.wallets.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Reloads the view from the store. The previous view stays on failure.
    pub async fn reload(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let wallets = store.load_active_wallets(TRACKED_WALLET_LIMIT).await?;
        let count = wallets.len();
        self.replace(wallets);
        Ok(count)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("RPC failure: {0}")]
    Rpc(#[from] RpcError),
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("mint account {0} not found")]
    MintNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The source returned no token accounts; nothing was written.
    NoAccounts,
    Refreshed { holders: usize, new_wallets: usize, tracked: usize },
    /// A step failed; see the log. Steps 1-2 failing leaves the store untouched.
    Failed,
}

pub struct Discovery {
    rpc: Arc<RpcClient>,
    store: Arc<dyn Store>,
    tracked: Arc<TrackedSet>,
}

impl Discovery {
    pub fn new(rpc: Arc<RpcClient>, store: Arc<dyn Store>, tracked: Arc<TrackedSet>) -> Self {
        Self { rpc, store, tracked }
    }

    pub fn tracked(&self) -> &Arc<TrackedSet> {
        &self.tracked
    }

    /// Runs one discovery pass for `token_address`. Never fails.
    pub async fn discover(&self, token_address: &str, top_n: usize) -> DiscoveryOutcome {
        info!(token = token_address, top_n, "Discovering top holders");
        match self.try_discover(token_address, top_n).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(token = token_address, error = %e, "Holder discovery failed, keeping previous state");
                DiscoveryOutcome::Failed
            }
        }
    }

    async fn try_discover(&self, token_address: &str, top_n: usize) -> Result<DiscoveryOutcome, DiscoveryError> {
        let accounts = self.rpc.get_token_accounts(token_address).await?;
        if accounts.is_empty() {
            warn!(token = token_address, "No token accounts returned, keeping existing holders");
            return Ok(DiscoveryOutcome::NoAccounts);
        }

        let mint = self
            .rpc
            .get_mint_info(token_address)
            .await?
            .ok_or_else(|| DiscoveryError::MintNotFound(token_address.to_string()))?;

        let holders = rank_holders(&accounts, &mint, top_n);
        let now = Utc::now();
        let snapshot = HolderSnapshot::new(token_address, holders, mint.ui_supply(), now);

        // Wallets first: the snapshot is only replaced once every holder is tracked,
        // and the view is reloaded even when an upsert fails halfway.
        let upserted = self.track_holders(&snapshot.holders, now).await;
        let tracked = self.tracked.reload(self.store.as_ref()).await?;
        let new_wallets = upserted?;
        self.store.replace_snapshot(&snapshot).await?;

        info!(
            token = token_address,
            holders = snapshot.holder_count,
            new_wallets,
            tracked,
            "Discovery complete"
        );
        Ok(DiscoveryOutcome::Refreshed {
            holders: snapshot.holder_count,
            new_wallets,
            tracked,
        })
    }

    async fn track_holders(&self, holders: &[TokenHolder], now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut new_wallets = 0;
        for holder in holders {
            if self.store.upsert_holder_wallet(&holder.owner, holder.balance, now).await? == UpsertOutcome::Inserted {
                new_wallets += 1;
                info!(wallet = %holder.owner, balance = holder.balance, "Auto-tracked wallet");
            }
        }
        Ok(new_wallets)
    }
}
