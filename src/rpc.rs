//! JSON-RPC envelope shared by every backend
//!
//! The driver accepts [`RpcRequest`]s and always answers with an [`RpcResponse`],
//! carrying either a `result` or an `error` object, regardless of which chain
//! backend served the call.

use crate::error::ZeroError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique request id
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single RPC call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

fn default_version() -> String {
    "2.0".to_string()
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: next_id(),
            method: method.into(),
            params,
        }
    }

    /// Same id and params under another method name
    pub fn with_method(&self, method: &str) -> Self {
        Self {
            method: method.to_string(),
            ..self.clone()
        }
    }

    /// Same id and method with replaced params
    pub fn with_params(&self, params: Vec<Value>) -> Self {
        Self {
            params,
            ..self.clone()
        }
    }

    /// First positional parameter, if any
    pub fn first_param(&self) -> Option<&Value> {
        self.params.first()
    }
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl From<&ZeroError> for RpcErrorObject {
    fn from(e: &ZeroError) -> Self {
        let message = match e {
            ZeroError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: e.rpc_code(),
            message,
        }
    }
}

/// Response envelope: exactly one of `result` / `error` is present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

impl RpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            outcome: RpcOutcome::Result(result),
        }
    }

    pub fn error(id: u64, error: &ZeroError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            outcome: RpcOutcome::Error(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Error(_))
    }

    /// Convert back into a `Result`, mapping the error object to [`ZeroError::Rpc`]
    pub fn into_result(self) -> Result<Value, ZeroError> {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(err) => Err(ZeroError::Rpc {
                code: err.code,
                message: err.message,
            }),
        }
    }
}
