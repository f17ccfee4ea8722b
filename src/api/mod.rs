//! HTTP API for health checks, status, parcel inspection and request ingest

use crate::config::ApiConfig;
use crate::error::{ZeroError, ZeroResult};
use crate::keeper::KeeperEngine;
use crate::lifecycle::{LoanProgress, Zero};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::state::{ParcelStats, ParcelStore};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Methods accepted by the ingest endpoint
const INGEST_METHODS: &[&str] = &["0cf_broadcastLiquidityRequest"];

const DEFAULT_PARCEL_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub zero: Arc<Zero>,
    pub store: Arc<dyn ParcelStore>,
    pub keeper: Arc<KeeperEngine>,
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/parcels", get(get_parcels))
        .route("/rpc", post(ingest))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ZeroResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ZeroError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ZeroError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and settlement chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();
    let settlement = state.zero.settlement().latest_block().await.is_ok();
    let ready = database && settlement;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            settlement,
        }),
    )
}

/// Get keeper status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = match state.store.stats().await {
        Ok(stats) => stats,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(None)),
    };

    let uptime = Utc::now().signed_duration_since(state.started_at);

    (
        StatusCode::OK,
        Json(Some(StatusResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.instance_id.clone(),
            uptime_seconds: uptime.num_seconds().max(0) as u64,
            keeper: state.zero.signer_address(),
            shifter_pool: state.zero.params().shifter_pool,
            backends: state.zero.driver().backend_names(),
            active_parcels: state.keeper.tracked(),
            parcels: stats,
        })),
    )
}

#[derive(Debug, Deserialize)]
struct ParcelQuery {
    limit: Option<usize>,
}

/// Most recently updated parcels
async fn get_parcels(State(state): State<AppState>, Query(query): Query<ParcelQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_PARCEL_LIMIT);

    match state.store.list(limit).await {
        Ok(parcels) => (
            StatusCode::OK,
            Json(parcels.iter().map(ParcelSummary::from).collect::<Vec<_>>()),
        ),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::new())),
    }
}

/// JSON-RPC ingest for borrowers publishing to this keeper
async fn ingest(State(state): State<AppState>, Json(request): Json<RpcRequest>) -> Json<RpcResponse> {
    if !INGEST_METHODS.contains(&request.method.as_str()) {
        let err = ZeroError::UnsupportedOperation(format!("{} is not accepted here", request.method));
        return Json(RpcResponse::error(request.id, &err));
    }

    Json(state.zero.driver().send(request).await)
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    settlement: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    instance_id: String,
    uptime_seconds: u64,
    keeper: Option<Address>,
    shifter_pool: Address,
    backends: Vec<&'static str>,
    active_parcels: usize,
    parcels: ParcelStats,
}

#[derive(Debug, Serialize)]
struct ParcelSummary {
    deposit_address: String,
    borrower: Address,
    proxy_address: Address,
    state: String,
    timeout_expiry: Option<u64>,
}

impl From<&LoanProgress> for ParcelSummary {
    fn from(progress: &LoanProgress) -> Self {
        Self {
            deposit_address: progress.key().to_string(),
            borrower: progress.parcel.request.borrower,
            proxy_address: progress.parcel.proxy_address(),
            state: progress.state().to_string(),
            timeout_expiry: progress.timeout_expiry,
        }
    }
}
