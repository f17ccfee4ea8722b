//! Attestation network backend
//!
//! Submissions are keyed by a deterministic request hash computed by the caller, so a
//! resubmission of identical fields returns the in-flight request instead of creating
//! a second one.

use super::{http_provider, map_provider_error, Backend};
use crate::config::AttestationConfig;
use crate::error::{ZeroError, ZeroResult};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use dashmap::DashSet;
use ethers::providers::{Http, Provider};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

const NAME: &str = "renvm";

/// Normalized status of one attestation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AttestationStatus {
    Pending,
    Signed { signature: Bytes },
    Failed { reason: String },
}

impl AttestationStatus {
    /// Interpret a raw `ren_queryTx` result
    pub fn from_query(raw: &Value) -> ZeroResult<Self> {
        let status = raw
            .get("txStatus")
            .and_then(Value::as_str)
            .unwrap_or("pending");

        match status {
            "done" => {
                // A finished request without a usable signature can never be repaid
                let Some(signature) = raw
                    .pointer("/tx/out/signature")
                    .or_else(|| raw.get("signature"))
                    .and_then(Value::as_str)
                else {
                    return Ok(AttestationStatus::Failed {
                        reason: "done without signature".to_string(),
                    });
                };
                match hex::decode(signature.trim_start_matches("0x")) {
                    Ok(signature) if !signature.is_empty() => Ok(AttestationStatus::Signed {
                        signature: signature.into(),
                    }),
                    Ok(_) => Ok(AttestationStatus::Failed {
                        reason: "done with empty signature".to_string(),
                    }),
                    Err(e) => Ok(AttestationStatus::Failed {
                        reason: format!("undecodable signature: {}", e),
                    }),
                }
            }
            "reverted" | "failed" => Ok(AttestationStatus::Failed {
                reason: raw
                    .get("revertReason")
                    .and_then(Value::as_str)
                    .unwrap_or("reverted")
                    .to_string(),
            }),
            _ => Ok(AttestationStatus::Pending),
        }
    }
}

/// Attestation network adapter
pub struct RenVmBackend {
    provider: Provider<Http>,
    /// Request hashes already accepted by the network
    submitted: DashSet<String>,
}

impl RenVmBackend {
    pub fn new(config: &AttestationConfig) -> ZeroResult<Self> {
        Ok(Self {
            provider: http_provider(NAME, &config.rpc_url)?,
            submitted: DashSet::new(),
        })
    }

    async fn raw(&self, method: &str, params: Vec<Value>) -> ZeroResult<Value> {
        self.provider
            .request::<_, Value>(method, params)
            .await
            .map_err(|e| map_provider_error(NAME, e))
    }

    async fn submit(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let payload = request
            .first_param()
            .cloned()
            .ok_or_else(|| ZeroError::InvalidRequest("ren_submitTx without payload".into()))?;
        let hash = payload
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| ZeroError::InvalidRequest("attestation payload without hash".into()))?
            .to_string();

        if self.submitted.contains(&hash) {
            debug!("Attestation {} already submitted", hash);
            return Ok(json!(hash));
        }

        match self.raw("ren_submitTx", vec![json!({ "tx": payload })]).await {
            Ok(_) => info!("Submitted attestation request {}", hash),
            Err(ZeroError::Rpc { message, .. }) if message.contains("already") => {
                debug!("Attestation {} known to the network", hash);
            }
            Err(e) => return Err(e),
        }

        self.submitted.insert(hash.clone());
        Ok(json!(hash))
    }

    async fn query(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let raw = self.raw("ren_queryTx", request.params.clone()).await?;
        Ok(serde_json::to_value(AttestationStatus::from_query(&raw)?)?)
    }
}

#[async_trait]
impl Backend for RenVmBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["ren"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        match request.method.as_str() {
            "ren_submitTx" => self.submit(request).await,
            "ren_queryTx" => self.query(request).await,
            _ => self.raw(&request.method, request.params.clone()).await,
        }
    }
}
