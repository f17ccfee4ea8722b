//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Backend availability
//! - Parcels received and deposits observed
//! - Attestation submissions
//! - Borrows executed and how loans settled

use crate::error::{ZeroError, ZeroResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder, GaugeVec,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Backend metrics
    pub static ref BACKEND_ERRORS: CounterVec = register_counter_vec!(
        "zero_backend_errors_total",
        "Transient backend failures by backend",
        &["backend"]
    ).unwrap();

    pub static ref SETTLEMENT_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "zero_settlement_block_height",
        "Latest settlement chain block seen by the keeper",
        &[]
    ).unwrap();

    // Parcel metrics
    pub static ref PARCELS_RECEIVED: CounterVec = register_counter_vec!(
        "zero_parcels_received_total",
        "Liquidity request parcels accepted from the signaling channel",
        &[]
    ).unwrap();

    pub static ref PARCELS_TRACKED: GaugeVec = register_gauge_vec!(
        "zero_parcels_tracked",
        "Parcels held by the keeper per lifecycle state",
        &["state"]
    ).unwrap();

    pub static ref DEPOSITS_CONFIRMED: CounterVec = register_counter_vec!(
        "zero_deposits_confirmed_total",
        "Deposits that reached the confirmation threshold",
        &[]
    ).unwrap();

    pub static ref ATTESTATIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "zero_attestations_submitted_total",
        "Mint requests submitted to the attestation network",
        &[]
    ).unwrap();

    // Loan metrics
    pub static ref BORROWS_EXECUTED: CounterVec = register_counter_vec!(
        "zero_borrows_executed_total",
        "Borrows executed by this keeper",
        &[]
    ).unwrap();

    pub static ref LOANS_SETTLED: CounterVec = register_counter_vec!(
        "zero_loans_settled_total",
        "Loans settled by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref DEPOSIT_LATENCY: HistogramVec = register_histogram_vec!(
        "zero_deposit_to_borrow_seconds",
        "Time from picking up a parcel to its executed borrow",
        &[],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 7200.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "zero_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "zero_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> ZeroResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ZeroError::Config(format!("Cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| ZeroError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_backend_error(backend: &str) {
    BACKEND_ERRORS.with_label_values(&[backend]).inc();
}

pub fn record_block_height(block: u64) {
    SETTLEMENT_BLOCK_HEIGHT.with_label_values(&[]).set(block as f64);
}

pub fn record_parcel_received() {
    PARCELS_RECEIVED.with_label_values(&[]).inc();
}

pub fn record_tracked(state: &str, count: usize) {
    PARCELS_TRACKED.with_label_values(&[state]).set(count as f64);
}

pub fn record_deposit_confirmed() {
    DEPOSITS_CONFIRMED.with_label_values(&[]).inc();
}

pub fn record_attestation_submitted() {
    ATTESTATIONS_SUBMITTED.with_label_values(&[]).inc();
}

pub fn record_borrow_executed(latency_secs: f64) {
    BORROWS_EXECUTED.with_label_values(&[]).inc();
    DEPOSIT_LATENCY.with_label_values(&[]).observe(latency_secs);
}

pub fn record_loan_settled(outcome: &str) {
    LOANS_SETTLED.with_label_values(&[outcome]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
