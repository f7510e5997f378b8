//! Thin REST wrappers over the store and the live engine, mounted under `/api`.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info};

use lib_tokenwise::core::{LiveCounters, build_dashboard};
use lib_tokenwise::model::{
    ActionKind, HourlyProtocolCount, HourlyVolume, ProtocolCount, TokenHolder, TransactionEvent, TransactionFilter,
    UpsertOutcome, VolumeSummary, WalletActivity, WalletVolume,
};
use lib_tokenwise::{Store, StoreError};

use crate::tokenwise_logic::state::AppState;

const DEFAULT_WALLET_TX_LIMIT: usize = 20;
const MAX_WALLET_TX_LIMIT: usize = 200;
const WALLET_PROTOCOL_ROWS: usize = 50;
const TOP_VOLUME_WALLETS: usize = 20;
const PROTOCOL_STATS_ROWS: usize = 20;
/// Window of the volume and protocol analytics.
const ANALYTICS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Store(StoreError::Rejected(detail)) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Store(e) => {
                error!(error = %e, "Storage failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/token-holders/{mint}", get(token_holders))
        .route("/wallets", post(track_wallet))
        .route("/wallets/{address}/transactions", get(wallet_transactions))
        .route("/analytics/dashboard", get(analytics_dashboard))
        .route("/analytics/protocols", get(analytics_protocols))
        .route("/analytics/volume", get(analytics_volume))
        .route("/realtime/status", get(realtime_status))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let monitor = state.monitor().state();
    let last_discovery_run = monitor
        .last_discovery
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "N/A".to_string());
    Json(json!({
        "status": "running",
        "monitoring_active": monitor.running,
        "connected_clients": state.registry().len(),
        "tracked_wallets": state.tracked().len(),
        "last_discovery_run": last_discovery_run,
    }))
}

#[derive(Debug, Serialize)]
struct HoldersResponse {
    token_address: String,
    holders: Vec<TokenHolder>,
    total_supply: f64,
    holder_count: usize,
    last_updated: DateTime<Utc>,
}

async fn token_holders(
    State(state): State<AppState>,
    Path(mint): Path<String>,
) -> Result<Json<HoldersResponse>, ApiError> {
    let snapshot = state
        .store()
        .find_snapshot(&mint)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No holder data for token {mint}")))?;
    Ok(Json(HoldersResponse {
        token_address: snapshot.token_address,
        holders: snapshot.holders,
        total_supply: snapshot.total_supply,
        holder_count: snapshot.holder_count,
        last_updated: snapshot.last_updated,
    }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct WalletTransactions {
    wallet_address: String,
    transactions: Vec<TransactionEvent>,
    protocol_usage: BTreeMap<String, u64>,
}

async fn wallet_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<WalletTransactions>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_WALLET_TX_LIMIT)
        .clamp(1, MAX_WALLET_TX_LIMIT);
    let filter = TransactionFilter::wallet(address.clone());
    let transactions = state.store().recent_transactions(&filter, limit).await?;
    let protocol_usage = state
        .store()
        .protocol_usage(&filter, WALLET_PROTOCOL_ROWS)
        .await?
        .into_iter()
        .map(|row| (row.protocol, row.count))
        .collect();
    Ok(Json(WalletTransactions {
        wallet_address: address,
        transactions,
        protocol_usage,
    }))
}

#[derive(Debug, Deserialize)]
struct TrackRequest {
    address: String,
}

/// Base58 Solana addresses are 32 to 44 characters.
fn valid_address(address: &str) -> bool {
    (32..=44).contains(&address.len())
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

async fn track_wallet(
    State(state): State<AppState>,
    Json(request): Json<TrackRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let address = request.address.trim();
    if !valid_address(address) {
        return Err(ApiError::BadRequest(format!("Invalid wallet address {address:?}")));
    }

    let outcome = state.store().track_wallet(address, Utc::now()).await?;
    let tracked = state.tracked().reload(state.store().as_ref()).await?;
    info!(wallet = address, ?outcome, tracked, "Wallet tracked on request");

    let status = match outcome {
        UpsertOutcome::Inserted => StatusCode::CREATED,
        UpsertOutcome::Updated => StatusCode::OK,
    };
    Ok((
        status,
        Json(json!({
            "address": address,
            "status": "tracked",
            "tracked_wallets": tracked,
        })),
    ))
}

#[derive(Debug, Serialize)]
struct DashboardSummary {
    total_wallets: u64,
    total_transactions: u64,
    buy_transactions: u64,
    sell_transactions: u64,
    buy_sell_ratio: f64,
}

#[derive(Debug, Serialize)]
struct AnalyticsDashboard {
    summary: DashboardSummary,
    recent_transactions: Vec<TransactionEvent>,
    protocol_usage: Vec<ProtocolCount>,
    most_active_wallets: Vec<WalletActivity>,
    top_holders: Vec<TokenHolder>,
    holder_count: usize,
    monitoring_active: bool,
    connected_clients: usize,
    timestamp: DateTime<Utc>,
}

/// Buys per sell, rounded to two places. No sells counts as one.
pub fn buy_sell_ratio(buys: u64, sells: u64) -> f64 {
    let ratio = buys as f64 / sells.max(1) as f64;
    (ratio * 100.0).round() / 100.0
}

async fn analytics_dashboard(State(state): State<AppState>) -> Result<Json<AnalyticsDashboard>, ApiError> {
    let store = state.store();
    let live = LiveCounters {
        monitoring_active: state.monitor().is_running(),
        connected_clients: state.registry().len(),
        tracked_wallets: state.tracked().len(),
    };
    let dashboard = build_dashboard(store.as_ref(), state.token(), live).await?;

    let total_wallets = store.count_active_wallets().await?;
    let total_transactions = store.count_transactions(&TransactionFilter::default()).await?;
    let buys = store.count_transactions(&TransactionFilter::action(ActionKind::Buy)).await?;
    let sells = store.count_transactions(&TransactionFilter::action(ActionKind::Sell)).await?;

    Ok(Json(AnalyticsDashboard {
        summary: DashboardSummary {
            total_wallets,
            total_transactions,
            buy_transactions: buys,
            sell_transactions: sells,
            buy_sell_ratio: buy_sell_ratio(buys, sells),
        },
        recent_transactions: dashboard.recent_transactions,
        protocol_usage: dashboard.protocol_usage,
        most_active_wallets: dashboard.most_active_wallets,
        top_holders: dashboard.top_holders,
        holder_count: dashboard.holder_count,
        monitoring_active: dashboard.monitoring_active,
        connected_clients: dashboard.connected_clients,
        timestamp: dashboard.timestamp,
    }))
}

#[derive(Debug, Serialize)]
struct ProtocolAnalytics {
    protocol_stats: Vec<ProtocolCount>,
    hourly_breakdown: Vec<HourlyProtocolCount>,
    timestamp: DateTime<Utc>,
}

async fn analytics_protocols(State(state): State<AppState>) -> Result<Json<ProtocolAnalytics>, ApiError> {
    let now = Utc::now();
    let since = now - chrono::Duration::hours(ANALYTICS_WINDOW_HOURS);
    let protocol_stats = state
        .store()
        .protocol_usage(&TransactionFilter::default(), PROTOCOL_STATS_ROWS)
        .await?;
    let hourly_breakdown = state.store().hourly_protocol_counts(since).await?;
    Ok(Json(ProtocolAnalytics {
        protocol_stats,
        hourly_breakdown,
        timestamp: now,
    }))
}

#[derive(Debug, Serialize)]
struct VolumeAnalytics {
    volume_24h: VolumeSummary,
    hourly_breakdown: Vec<HourlyVolume>,
    top_volume_wallets: Vec<WalletVolume>,
    timestamp: DateTime<Utc>,
}

async fn analytics_volume(State(state): State<AppState>) -> Result<Json<VolumeAnalytics>, ApiError> {
    let now = Utc::now();
    let since = now - chrono::Duration::hours(ANALYTICS_WINDOW_HOURS);
    let store = state.store();
    Ok(Json(VolumeAnalytics {
        volume_24h: store.volume_since(since).await?,
        hourly_breakdown: store.hourly_volume(since).await?,
        top_volume_wallets: store.top_volume_wallets(since, TOP_VOLUME_WALLETS).await?,
        timestamp: now,
    }))
}

async fn realtime_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let last_hour = state
        .store()
        .count_transactions(&TransactionFilter::since(now - chrono::Duration::hours(1)))
        .await?;
    let monitor = state.monitor().state();
    Ok(Json(json!({
        "monitoring_active": monitor.running,
        "connected_clients": state.registry().len(),
        "tracked_wallets": state.tracked().len(),
        "monitored_token": state.token(),
        "recent_transactions_1h": last_hour,
        "last_processed_slot": monitor.last_processed_slot,
        "timestamp": now,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use lib_tokenwise::model::HolderSnapshot;
    use lib_tokenwise::MemoryStore;
    use std::sync::Arc;

    use crate::tokenwise_logic::state::testing::app;

    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn event(signature: &str, action: ActionKind, minutes_ago: i64) -> TransactionEvent {
        let timestamp = Utc::now() - chrono::Duration::minutes(minutes_ago);
        TransactionEvent {
            signature: signature.to_string(),
            timestamp,
            wallet: WALLET.to_string(),
            token_address: "mint".to_string(),
            amount: 100.0,
            action_type: action,
            protocol: "Orca".to_string(),
            block_time: timestamp.timestamp(),
            slot: 1,
            from_address: None,
            to_address: None,
            pre_balance: None,
            post_balance: None,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn ratio_rounds_and_guards_zero_sells() {
        assert_eq!(buy_sell_ratio(0, 0), 0.0);
        assert_eq!(buy_sell_ratio(5, 0), 5.0);
        assert_eq!(buy_sell_ratio(2, 3), 0.67);
    }

    #[test]
    fn address_validation() {
        assert!(valid_address(WALLET));
        assert!(!valid_address(""));
        assert!(!valid_address("short"));
        assert!(!valid_address("0xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU"));
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_found() {
        let state = app(Arc::new(MemoryStore::new()));
        let err = token_holders(State(state), Path("mint".to_string())).await.unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["detail"], "No holder data for token mint");
    }

    #[tokio::test]
    async fn storage_failure_hides_detail() {
        let store = Arc::new(MemoryStore::new());
        let state = app(store.clone());
        store.set_offline(true);

        let err = analytics_volume(State(state)).await.unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await, json!({"detail": "Internal error"}));
    }

    #[tokio::test]
    async fn snapshot_is_served() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = HolderSnapshot::new("mint", Vec::new(), 0.0, Utc::now());
        store.replace_snapshot(&snapshot).await.unwrap();
        let state = app(store);

        let Json(body) = token_holders(State(state), Path("mint".to_string())).await.unwrap();
        assert_eq!(body.holder_count, 0);
        assert_eq!(body.token_address, "mint");
    }

    #[tokio::test]
    async fn tracking_a_wallet_reloads_the_view() {
        let state = app(Arc::new(MemoryStore::new()));

        let request = TrackRequest { address: WALLET.to_string() };
        let (status, Json(body)) = track_wallet(State(state.clone()), Json(request)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["tracked_wallets"], 1);
        assert_eq!(state.tracked().len(), 1);

        let request = TrackRequest { address: WALLET.to_string() };
        let (status, _) = track_wallet(State(state.clone()), Json(request)).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        let bad = TrackRequest { address: "nope".to_string() };
        let err = track_wallet(State(state), Json(bad)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wallet_and_analytics_views() {
        let store = Arc::new(MemoryStore::new());
        store.track_wallet(WALLET, Utc::now()).await.unwrap();
        store.insert_transaction(&event("s1", ActionKind::Buy, 5)).await.unwrap();
        store.insert_transaction(&event("s2", ActionKind::Buy, 90)).await.unwrap();
        store.insert_transaction(&event("s3", ActionKind::Sell, 60 * 30)).await.unwrap();
        let state = app(store);

        let Json(wallet) = wallet_transactions(
            State(state.clone()),
            Path(WALLET.to_string()),
            Query(LimitQuery { limit: Some(2) }),
        )
        .await
        .unwrap();
        assert_eq!(wallet.transactions.len(), 2);
        assert_eq!(wallet.transactions[0].signature, "s1");
        assert_eq!(wallet.protocol_usage.get("Orca"), Some(&3));

        let Json(dashboard) = analytics_dashboard(State(state.clone())).await.unwrap();
        assert_eq!(dashboard.summary.total_wallets, 1);
        assert_eq!(dashboard.summary.total_transactions, 3);
        assert_eq!(dashboard.summary.buy_transactions, 2);
        assert_eq!(dashboard.summary.buy_sell_ratio, 2.0);
        assert!(!dashboard.monitoring_active);

        let Json(volume) = analytics_volume(State(state.clone())).await.unwrap();
        assert_eq!(volume.volume_24h.transaction_count, 2);
        assert_eq!(volume.volume_24h.buy_volume, 200.0);
        assert_eq!(volume.top_volume_wallets.len(), 1);
        assert_eq!(volume.top_volume_wallets[0].total_volume, 200.0);
        let hourly_total: u64 = volume.hourly_breakdown.iter().map(|h| h.transactions).sum();
        assert_eq!(hourly_total, 2);
        assert!(volume.hourly_breakdown.windows(2).all(|w| w[0].hour < w[1].hour));

        let Json(realtime) = realtime_status(State(state)).await.unwrap();
        assert_eq!(realtime["recent_transactions_1h"], 1);
        assert_eq!(realtime["monitored_token"], "mint");
    }

    #[tokio::test]
    async fn protocol_analytics_split_by_hour() {
        let store = Arc::new(MemoryStore::new());
        let orca = event("s1", ActionKind::Buy, 0);
        let mut jupiter = event("s2", ActionKind::Sell, 0);
        jupiter.timestamp = orca.timestamp;
        jupiter.protocol = "Jupiter".to_string();
        store.insert_transaction(&orca).await.unwrap();
        store.insert_transaction(&jupiter).await.unwrap();
        store.insert_transaction(&event("s3", ActionKind::Buy, 60 * 48)).await.unwrap();
        let state = app(store);

        let Json(body) = analytics_protocols(State(state)).await.unwrap();
        let stats: Vec<_> = body.protocol_stats.iter().map(|r| (r.protocol.as_str(), r.count)).collect();
        assert_eq!(stats, vec![("Orca", 2), ("Jupiter", 1)]);

        // The two-day-old event is outside the hourly window.
        let hourly: Vec<_> = body.hourly_breakdown.iter().map(|r| (r.protocol.as_str(), r.count)).collect();
        assert_eq!(hourly, vec![("Jupiter", 1), ("Orca", 1)]);
        assert_eq!(body.hourly_breakdown[0].hour, body.hourly_breakdown[1].hour);

        let value = serde_json::to_value(&body.protocol_stats).unwrap();
        assert_eq!(value[0], json!({"_id": "Orca", "count": 2}));
    }
}
