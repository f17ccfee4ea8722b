//! Settlement chain backend with multi-RPC failover and optional local signing

use super::{http_provider, map_provider_error, Backend};
use crate::config::EthereumConfig;
use crate::error::{ZeroError, ZeroResult};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::middleware::signer::SignerMiddlewareError;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, info, warn};

const NAME: &str = "ethereum";

/// Settlement chain adapter
pub struct EthereumBackend {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Local signer; when absent the node's own accounts sign
    wallet: Option<LocalWallet>,
}

impl EthereumBackend {
    /// Create a backend over every configured RPC URL
    pub fn new(config: &EthereumConfig, wallet: Option<LocalWallet>) -> ZeroResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match http_provider(NAME, url) {
                Ok(provider) => {
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ZeroError::Config("No valid Ethereum RPC providers".to_string()));
        }

        let wallet = wallet.map(|w| w.with_chain_id(config.chain_id));
        if let Some(ref w) = wallet {
            info!("Ethereum backend signing locally as {:?}", w.address());
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Forward a call, rotating providers on transport failures
    async fn forward(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .request::<_, Value>(&request.method, request.params.clone())
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) => match map_provider_error(NAME, e) {
                    err @ ZeroError::BackendUnavailable { .. } => {
                        warn!("{} failed on chain {}: {}", request.method, self.chain_id, err);
                        self.failover();
                        last_error = Some(err);
                    }
                    err => return Err(err),
                },
            }
        }

        Err(last_error.unwrap_or_else(|| ZeroError::BackendUnavailable {
            backend: NAME.to_string(),
            message: "All providers failed".to_string(),
        }))
    }

    /// Fill, sign and submit a transaction with the local wallet
    async fn sign_and_send(&self, wallet: &LocalWallet, request: &RpcRequest) -> ZeroResult<Value> {
        let payload = request
            .first_param()
            .cloned()
            .ok_or_else(|| ZeroError::InvalidRequest("eth_sendTransaction without payload".into()))?;
        let tx: TransactionRequest = serde_json::from_value(payload)?;

        let client = SignerMiddleware::new(self.http().clone(), wallet.clone());
        let pending = client
            .send_transaction(TypedTransaction::Legacy(tx), None)
            .await
            .map_err(|e| match e {
                SignerMiddlewareError::MiddlewareError(inner) => map_provider_error(NAME, inner),
                other => {
                    error!("Failed to sign transaction: {}", other);
                    ZeroError::Internal(other.to_string())
                }
            })?;

        let tx_hash = pending.tx_hash();
        info!("Transaction sent on chain {}: {:?}", self.chain_id, tx_hash);
        Ok(serde_json::to_value(tx_hash)?)
    }

    /// `personal_sign` / `eth_sign` with the local wallet
    async fn sign_message(&self, wallet: &LocalWallet, request: &RpcRequest) -> ZeroResult<Value> {
        // personal_sign is [data, address]; eth_sign is [address, data]
        let data_index = if request.method == "eth_sign" { 1 } else { 0 };
        let data = request
            .params
            .get(data_index)
            .and_then(Value::as_str)
            .ok_or_else(|| ZeroError::InvalidRequest(format!("{} without data", request.method)))?;
        let bytes = hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| ZeroError::Encoding(e.to_string()))?;

        let signature = wallet
            .sign_message(bytes)
            .await
            .map_err(|e| ZeroError::Internal(e.to_string()))?;
        Ok(json!(format!("0x{}", hex::encode(signature.to_vec()))))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.forward(&RpcRequest::new("eth_blockNumber", vec![])).await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }
}

#[async_trait]
impl Backend for EthereumBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["eth", "personal", "net", "web3"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let Some(wallet) = self.wallet.as_ref() else {
            return self.forward(request).await;
        };

        match request.method.as_str() {
            "eth_accounts" | "eth_requestAccounts" => Ok(json!([wallet.address()])),
            "eth_sendTransaction" => self.sign_and_send(wallet, request).await,
            "personal_sign" | "eth_sign" => self.sign_message(wallet, request).await,
            _ => self.forward(request).await,
        }
    }
}
