//! # PostgreSQL Store
//!
//! `Store` implementation over a `deadpool-postgres` pool. The schema is created
//! on connect. Idempotent writes rely on `ON CONFLICT`, so concurrent upserts
//! from the monitor loop and the REST handlers need no extra locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use crate::connections::store::Store;
use crate::error::StoreError;
use crate::model::{
    ActionKind, HolderSnapshot, HourlyProtocolCount, HourlyVolume, InsertOutcome, ProtocolCount, TokenHolder,
    TrackedWallet, TransactionEvent, TransactionFilter, UpsertOutcome, VolumeSummary, WalletActivity, WalletVolume,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    seq              BIGSERIAL,
    address          TEXT PRIMARY KEY,
    tracked_since    TIMESTAMPTZ NOT NULL,
    active           BOOLEAN NOT NULL DEFAULT TRUE,
    balance          DOUBLE PRECISION,
    token_amount     DOUBLE PRECISION,
    last_transaction TIMESTAMPTZ,
    last_updated     TIMESTAMPTZ,
    total_buys       BIGINT NOT NULL DEFAULT 0,
    total_sells      BIGINT NOT NULL DEFAULT 0,
    profit_loss      DOUBLE PRECISION
);

CREATE TABLE IF NOT EXISTS realtime_transactions (
    id            BIGSERIAL PRIMARY KEY,
    signature     TEXT NOT NULL UNIQUE,
    "timestamp"   TIMESTAMPTZ NOT NULL,
    wallet        TEXT NOT NULL,
    token_address TEXT NOT NULL,
    amount        DOUBLE PRECISION NOT NULL,
    action_type   TEXT NOT NULL,
    protocol      TEXT NOT NULL,
    block_time    BIGINT NOT NULL,
    slot          BIGINT NOT NULL,
    from_address  TEXT,
    to_address    TEXT,
    pre_balance   DOUBLE PRECISION,
    post_balance  DOUBLE PRECISION
);
CREATE INDEX IF NOT EXISTS realtime_transactions_ts_idx ON realtime_transactions ("timestamp" DESC);
CREATE INDEX IF NOT EXISTS realtime_transactions_wallet_idx ON realtime_transactions (wallet);

CREATE TABLE IF NOT EXISTS token_holders (
    token_address TEXT PRIMARY KEY,
    holders       JSONB NOT NULL,
    total_supply  DOUBLE PRECISION NOT NULL,
    holder_count  BIGINT NOT NULL,
    last_updated  TIMESTAMPTZ NOT NULL
);
"#;

const WALLET_COLUMNS: &str = "address, tracked_since, active, balance, token_amount, last_transaction, \
     last_updated, total_buys, total_sells, profit_loss";

const TX_COLUMNS: &str = "signature, \"timestamp\", wallet, token_address, amount, action_type, protocol, \
     block_time, slot, from_address, to_address, pre_balance, post_balance";

/// `$1` wallet, `$2` action, `$3` since. A NULL parameter disables its condition.
const TX_FILTER: &str = "($1::text IS NULL OR wallet = $1) \
     AND ($2::text IS NULL OR action_type = $2) \
     AND ($3::timestamptz IS NULL OR \"timestamp\" >= $3)";

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Builds the pool for `database_url` and creates the schema if needed.
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let mut cfg = DeadpoolConfig::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(pool_size.max(1)));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(format!("failed to create database pool: {e}")))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(pool_size, "Postgres store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await.map_err(unavailable)?;
        debug!("Schema verified");
        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to get connection from pool: {e}")))
    }
}

fn unavailable(err: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupt(err: tokio_postgres::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

/// Row limits arrive as `usize`; Postgres wants a BIGINT.
fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn count_from(raw: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative {what}: {raw}")))
}

fn filter_params(filter: &TransactionFilter) -> (Option<&str>, Option<&'static str>, Option<DateTime<Utc>>) {
    (filter.wallet.as_deref(), filter.action.map(|a| a.as_str()), filter.since)
}

fn wallet_from_row(row: &Row) -> Result<TrackedWallet, StoreError> {
    let wallet = TrackedWallet {
        address: row.try_get("address").map_err(corrupt)?,
        tracked_since: row.try_get("tracked_since").map_err(corrupt)?,
        active: row.try_get("active").map_err(corrupt)?,
        balance: row.try_get("balance").map_err(corrupt)?,
        token_amount: row.try_get("token_amount").map_err(corrupt)?,
        last_transaction: row.try_get("last_transaction").map_err(corrupt)?,
        last_updated: row.try_get("last_updated").map_err(corrupt)?,
        total_buys: count_from(row.try_get("total_buys").map_err(corrupt)?, "total_buys")?,
        total_sells: count_from(row.try_get("total_sells").map_err(corrupt)?, "total_sells")?,
        profit_loss: row.try_get("profit_loss").map_err(corrupt)?,
    };
    wallet.validate().map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(wallet)
}

fn event_from_row(row: &Row) -> Result<TransactionEvent, StoreError> {
    let action: String = row.try_get("action_type").map_err(corrupt)?;
    let action_type =
        ActionKind::parse(&action).ok_or_else(|| StoreError::Corrupt(format!("unknown action_type {action:?}")))?;
    let slot: i64 = row.try_get("slot").map_err(corrupt)?;

    let event = TransactionEvent {
        signature: row.try_get("signature").map_err(corrupt)?,
        timestamp: row.try_get("timestamp").map_err(corrupt)?,
        wallet: row.try_get("wallet").map_err(corrupt)?,
        token_address: row.try_get("token_address").map_err(corrupt)?,
        amount: row.try_get("amount").map_err(corrupt)?,
        action_type,
        protocol: row.try_get("protocol").map_err(corrupt)?,
        block_time: row.try_get("block_time").map_err(corrupt)?,
        slot: count_from(slot, "slot")?,
        from_address: row.try_get("from_address").map_err(corrupt)?,
        to_address: row.try_get("to_address").map_err(corrupt)?,
        pre_balance: row.try_get("pre_balance").map_err(corrupt)?,
        post_balance: row.try_get("post_balance").map_err(corrupt)?,
    };
    event.validate().map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(event)
}

#[async_trait]
impl Store for PgStore {
    async fn load_active_wallets(&self, limit: usize) -> Result<Vec<TrackedWallet>, StoreError> {
        let client = self.client().await?;
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE active ORDER BY seq LIMIT $1");
        let rows = client.query(&sql, &[&limit_param(limit)]).await.map_err(unavailable)?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn find_wallet(&self, address: &str) -> Result<Option<TrackedWallet>, StoreError> {
        let client = self.client().await?;
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = $1");
        let row = client.query_opt(&sql, &[&address]).await.map_err(unavailable)?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn track_wallet(&self, address: &str, now: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        TrackedWallet::new(address, None, now).validate()?;
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO wallets (address, tracked_since, active, last_updated) \
                 VALUES ($1, $2, TRUE, $2) \
                 ON CONFLICT (address) DO UPDATE SET active = TRUE, last_updated = EXCLUDED.last_updated \
                 RETURNING (xmax = 0) AS inserted",
                &[&address, &now],
            )
            .await
            .map_err(unavailable)?;
        let inserted: bool = row.try_get("inserted").map_err(corrupt)?;
        Ok(if inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Updated })
    }

    async fn upsert_holder_wallet(
        &self,
        address: &str,
        balance: f64,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        TrackedWallet::new(address, Some(balance), now).validate()?;
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO wallets (address, tracked_since, active, balance, token_amount, last_updated) \
                 VALUES ($1, $3, TRUE, $2, $2, $3) \
                 ON CONFLICT (address) DO UPDATE SET \
                     balance = EXCLUDED.balance, \
                     token_amount = EXCLUDED.token_amount, \
                     last_updated = EXCLUDED.last_updated \
                 RETURNING (xmax = 0) AS inserted",
                &[&address, &balance, &now],
            )
            .await
            .map_err(unavailable)?;
        let inserted: bool = row.try_get("inserted").map_err(corrupt)?;
        Ok(if inserted { UpsertOutcome::Inserted } else { UpsertOutcome::Updated })
    }

    async fn apply_wallet_activity(&self, event: &TransactionEvent) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE wallets SET \
                     total_buys = total_buys + CASE WHEN $2::text = 'buy' THEN 1 ELSE 0 END, \
                     total_sells = total_sells + CASE WHEN $2::text = 'sell' THEN 1 ELSE 0 END, \
                     last_transaction = $3 \
                 WHERE address = $1",
                &[&event.wallet, &event.action_type.as_str(), &event.timestamp],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn count_active_wallets(&self) -> Result<u64, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM wallets WHERE active", &[])
            .await
            .map_err(unavailable)?;
        count_from(row.try_get(0).map_err(corrupt)?, "wallet count")
    }

    async fn find_snapshot(&self, token_address: &str) -> Result<Option<HolderSnapshot>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT token_address, holders, total_supply, holder_count, last_updated \
                 FROM token_holders WHERE token_address = $1",
                &[&token_address],
            )
            .await
            .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let Json(holders): Json<Vec<TokenHolder>> = row.try_get("holders").map_err(corrupt)?;
        let holder_count: i64 = row.try_get("holder_count").map_err(corrupt)?;
        let snapshot = HolderSnapshot {
            token_address: row.try_get("token_address").map_err(corrupt)?,
            holders,
            total_supply: row.try_get("total_supply").map_err(corrupt)?,
            holder_count: count_from(holder_count, "holder_count")? as usize,
            last_updated: row.try_get("last_updated").map_err(corrupt)?,
        };
        snapshot.validate().map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn replace_snapshot(&self, snapshot: &HolderSnapshot) -> Result<(), StoreError> {
        snapshot.validate()?;
        let client = self.client().await?;
        let holder_count = limit_param(snapshot.holder_count);
        client
            .execute(
                "INSERT INTO token_holders (token_address, holders, total_supply, holder_count, last_updated) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (token_address) DO UPDATE SET \
                     holders = EXCLUDED.holders, \
                     total_supply = EXCLUDED.total_supply, \
                     holder_count = EXCLUDED.holder_count, \
                     last_updated = EXCLUDED.last_updated",
                &[
                    &snapshot.token_address,
                    &Json(&snapshot.holders),
                    &snapshot.total_supply,
                    &holder_count,
                    &snapshot.last_updated,
                ],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn insert_transaction(&self, event: &TransactionEvent) -> Result<InsertOutcome, StoreError> {
        event.validate()?;
        let slot = i64::try_from(event.slot)
            .map_err(|_| StoreError::Rejected(format!("slot {} out of range", event.slot)))?;
        let client = self.client().await?;
        let sql = format!(
            "INSERT INTO realtime_transactions ({TX_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (signature) DO NOTHING"
        );
        let params: [&(dyn ToSql + Sync); 13] = [
            &event.signature,
            &event.timestamp,
            &event.wallet,
            &event.token_address,
            &event.amount,
            &event.action_type.as_str(),
            &event.protocol,
            &event.block_time,
            &slot,
            &event.from_address,
            &event.to_address,
            &event.pre_balance,
            &event.post_balance,
        ];
        let inserted = client.execute(&sql, &params).await.map_err(unavailable)?;
        Ok(if inserted == 0 { InsertOutcome::Duplicate } else { InsertOutcome::Inserted })
    }

    async fn recent_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
    ) -> Result<Vec<TransactionEvent>, StoreError> {
        let client = self.client().await?;
        let (wallet, action, since) = filter_params(filter);
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM realtime_transactions WHERE {TX_FILTER} \
             ORDER BY \"timestamp\" DESC, id DESC LIMIT $4"
        );
        let rows = client
            .query(&sql, &[&wallet, &action, &since, &limit_param(limit)])
            .await
            .map_err(unavailable)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64, StoreError> {
        let client = self.client().await?;
        let (wallet, action, since) = filter_params(filter);
        let sql = format!("SELECT COUNT(*) FROM realtime_transactions WHERE {TX_FILTER}");
        let row = client
            .query_one(&sql, &[&wallet, &action, &since])
            .await
            .map_err(unavailable)?;
        count_from(row.try_get(0).map_err(corrupt)?, "transaction count")
    }

    async fn protocol_usage(&self, filter: &TransactionFilter, limit: usize) -> Result<Vec<ProtocolCount>, StoreError> {
        let client = self.client().await?;
        let (wallet, action, since) = filter_params(filter);
        let sql = format!(
            "SELECT protocol, COUNT(*) AS count FROM realtime_transactions WHERE {TX_FILTER} \
             GROUP BY protocol ORDER BY count DESC, protocol ASC LIMIT $4"
        );
        let rows = client
            .query(&sql, &[&wallet, &action, &since, &limit_param(limit)])
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(ProtocolCount {
                    protocol: row.try_get("protocol").map_err(corrupt)?,
                    count: count_from(row.try_get("count").map_err(corrupt)?, "protocol count")?,
                })
            })
            .collect()
    }

    async fn most_active_wallets(&self, limit: usize) -> Result<Vec<WalletActivity>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT wallet, COUNT(*) AS tx_count FROM realtime_transactions \
                 GROUP BY wallet ORDER BY tx_count DESC, wallet ASC LIMIT $1",
                &[&limit_param(limit)],
            )
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(WalletActivity {
                    wallet_address: row.try_get("wallet").map_err(corrupt)?,
                    tx_count: count_from(row.try_get("tx_count").map_err(corrupt)?, "tx_count")?,
                })
            })
            .collect()
    }

    async fn volume_since(&self, since: DateTime<Utc>) -> Result<VolumeSummary, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT \
                     COALESCE(SUM(amount), 0)::float8 AS total_volume, \
                     COALESCE(SUM(CASE WHEN action_type = 'buy' THEN amount ELSE 0 END), 0)::float8 AS buy_volume, \
                     COALESCE(SUM(CASE WHEN action_type = 'sell' THEN amount ELSE 0 END), 0)::float8 AS sell_volume, \
                     COUNT(*) AS transaction_count \
                 FROM realtime_transactions WHERE \"timestamp\" >= $1",
                &[&since],
            )
            .await
            .map_err(unavailable)?;
        Ok(VolumeSummary {
            total_volume: row.try_get("total_volume").map_err(corrupt)?,
            buy_volume: row.try_get("buy_volume").map_err(corrupt)?,
            sell_volume: row.try_get("sell_volume").map_err(corrupt)?,
            transaction_count: count_from(row.try_get("transaction_count").map_err(corrupt)?, "transaction_count")?,
        })
    }

    async fn top_volume_wallets(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<WalletVolume>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT wallet, SUM(amount)::float8 AS total_volume, COUNT(*) AS transaction_count \
                 FROM realtime_transactions WHERE \"timestamp\" >= $1 \
                 GROUP BY wallet ORDER BY total_volume DESC, wallet ASC LIMIT $2",
                &[&since, &limit_param(limit)],
            )
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(WalletVolume {
                    wallet_address: row.try_get("wallet").map_err(corrupt)?,
                    total_volume: row.try_get("total_volume").map_err(corrupt)?,
                    transaction_count: count_from(row.try_get("transaction_count").map_err(corrupt)?, "transaction_count")?,
                })
            })
            .collect()
    }

    async fn hourly_protocol_counts(&self, since: DateTime<Utc>) -> Result<Vec<HourlyProtocolCount>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT date_trunc('hour', \"timestamp\" AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS hour, \
                     protocol, COUNT(*) AS count \
                 FROM realtime_transactions WHERE \"timestamp\" >= $1 \
                 GROUP BY hour, protocol ORDER BY hour ASC, protocol ASC",
                &[&since],
            )
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(HourlyProtocolCount {
                    hour: row.try_get("hour").map_err(corrupt)?,
                    protocol: row.try_get("protocol").map_err(corrupt)?,
                    count: count_from(row.try_get("count").map_err(corrupt)?, "count")?,
                })
            })
            .collect()
    }

    async fn hourly_volume(&self, since: DateTime<Utc>) -> Result<Vec<HourlyVolume>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT date_trunc('hour', \"timestamp\" AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS hour, \
                     SUM(amount)::float8 AS volume, \
                     COUNT(*) AS transactions, \
                     COALESCE(SUM(CASE WHEN action_type = 'buy' THEN amount ELSE 0 END), 0)::float8 AS buy_volume, \
                     COALESCE(SUM(CASE WHEN action_type = 'sell' THEN amount ELSE 0 END), 0)::float8 AS sell_volume \
                 FROM realtime_transactions WHERE \"timestamp\" >= $1 \
                 GROUP BY hour ORDER BY hour ASC",
                &[&since],
            )
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                Ok(HourlyVolume {
                    hour: row.try_get("hour").map_err(corrupt)?,
                    volume: row.try_get("volume").map_err(corrupt)?,
                    transactions: count_from(row.try_get("transactions").map_err(corrupt)?, "transactions")?,
                    buy_volume: row.try_get("buy_volume").map_err(corrupt)?,
                    sell_volume: row.try_get("sell_volume").map_err(corrupt)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_never_overflow_bigint() {
        assert_eq!(limit_param(20), 20);
        assert_eq!(limit_param(usize::MAX), i64::MAX);
    }

    #[test]
    fn negative_counts_are_corrupt() {
        assert_eq!(count_from(3, "x").unwrap(), 3);
        assert!(matches!(count_from(-1, "x"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn filter_params_map_action_to_text() {
        let filter = TransactionFilter::action(ActionKind::Sell);
        let (wallet, action, since) = filter_params(&filter);
        assert!(wallet.is_none());
        assert_eq!(action, Some("sell"));
        assert!(since.is_none());
    }

    #[tokio::test]
    async fn unreachable_database_is_unavailable() {
        // Port 1 is never a Postgres server.
        let result = PgStore::connect("postgres://tokenwise@127.0.0.1:1/tokenwise", 1).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
