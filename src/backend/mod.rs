//! Backend adapters - one per chain or service the driver can reach
//!
//! Each adapter normalizes a native RPC surface into the uniform [`Backend`] call
//! interface:
//! - `ethereum`: the settlement chain (`eth_*`, `personal_*`, `net_*`, `web3_*`)
//! - `btc`: the collateral UTXO chain (`btc_*`)
//! - `renvm`: the attestation network (`ren_*`)
//! - `zero`: the signaling channel and active borrow proxy selection (`0cf_*`)

pub mod btc;
pub mod ethereum;
pub mod renvm;
pub mod zero;

pub use btc::BitcoinBackend;
pub use ethereum::EthereumBackend;
pub use renvm::{AttestationStatus, RenVmBackend};
pub use zero::{ActiveProxy, ZeroBackend};

use crate::error::{ZeroError, ZeroResult};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError};
use serde_json::Value;
use std::time::Duration;

/// Uniform call interface over one chain's RPC surface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name, e.g. `ethereum`
    fn name(&self) -> &'static str;

    /// Method-name prefixes this backend answers, without the trailing underscore
    fn prefixes(&self) -> &'static [&'static str];

    /// Execute one call and return its raw `result`
    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value>;
}

/// Build an HTTP JSON-RPC client for a backend endpoint
pub(crate) fn http_provider(backend: &str, url: &str) -> ZeroResult<Provider<Http>> {
    Provider::<Http>::try_from(url)
        .map(|p| p.interval(Duration::from_millis(100)))
        .map_err(|e| ZeroError::Config(format!("Invalid {} RPC URL {}: {}", backend, url, e)))
}

/// Map a provider error: JSON-RPC error responses stay RPC errors, anything else is
/// a transport failure and therefore transient
pub(crate) fn map_provider_error(backend: &str, err: ProviderError) -> ZeroError {
    let response = match &err {
        ProviderError::JsonRpcClientError(inner) => inner.as_error_response().cloned(),
        _ => None,
    };

    match response {
        Some(rpc) => ZeroError::Rpc {
            code: rpc.code,
            message: rpc.message,
        },
        None => ZeroError::BackendUnavailable {
            backend: backend.to_string(),
            message: err.to_string(),
        },
    }
}
