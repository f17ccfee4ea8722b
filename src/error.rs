//! Error types for the zero-confirmation engine

use thiserror::Error;

/// Main error type for routing, lifecycle and keeper operations
#[derive(Error, Debug)]
pub enum ZeroError {
    #[error("No backend handles method {method}")]
    UnknownMethod { method: String },

    #[error("Prefix {prefix} claimed by both {existing} and {incoming}")]
    DuplicatePrefix {
        prefix: String,
        existing: String,
        incoming: String,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Backend {backend} unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Attestation {request_id} failed: {reason}")]
    AttestationFailed { request_id: String, reason: String },

    #[error("Repayment rejected for proxy {proxy}: {reason}")]
    RepaymentRejected { proxy: String, reason: String },

    #[error("Default rejected for proxy {proxy}: {reason}")]
    DefaultRejected { proxy: String, reason: String },

    #[error("No signer bound")]
    SigningUnavailable,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid liquidity request: {0}")]
    InvalidRequest(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cancelled while waiting for {operation}")]
    Cancelled { operation: String },

    #[error("Gave up on {operation} after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ZeroError {
    /// Check if error is transient and the same call may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZeroError::BackendUnavailable { .. })
    }

    /// Numeric code used in the RPC error envelope
    pub fn rpc_code(&self) -> i64 {
        match self {
            ZeroError::Rpc { code, .. } => *code,
            ZeroError::UnknownMethod { .. } => -32601,
            ZeroError::InvalidRequest(_) | ZeroError::Encoding(_) => -32602,
            ZeroError::UnsupportedOperation(_) => 4200,
            ZeroError::SigningUnavailable => 4100,
            _ => -32000,
        }
    }
}

impl From<serde_json::Error> for ZeroError {
    fn from(e: serde_json::Error) -> Self {
        ZeroError::Encoding(e.to_string())
    }
}

impl From<ethers::abi::Error> for ZeroError {
    fn from(e: ethers::abi::Error) -> Self {
        ZeroError::Encoding(e.to_string())
    }
}

/// Result type for zero-confirmation operations
pub type ZeroResult<T> = Result<T, ZeroError>;
