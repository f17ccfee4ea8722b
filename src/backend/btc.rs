//! Collateral chain backend: UTXO lookups against a bitcoin indexer
//!
//! The indexer speaks JSON-RPC and reports outputs in its own shape; this adapter
//! rewrites every output into a [`Utxo`] so callers never see indexer specifics.

use super::{http_provider, map_provider_error, Backend};
use crate::config::BitcoinConfig;
use crate::error::{ZeroError, ZeroResult};
use crate::request::Utxo;
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::H256;
use serde_json::Value;
use tracing::debug;

const NAME: &str = "btc";

/// Bitcoin-style UTXO chain adapter
pub struct BitcoinBackend {
    provider: Provider<Http>,
    network: bitcoin::Network,
}

impl BitcoinBackend {
    pub fn new(config: &BitcoinConfig) -> ZeroResult<Self> {
        Ok(Self {
            provider: http_provider(NAME, &config.rpc_url)?,
            network: config.network,
        })
    }

    pub fn network(&self) -> bitcoin::Network {
        self.network
    }

    pub fn is_testnet(&self) -> bool {
        self.network != bitcoin::Network::Bitcoin
    }

    async fn raw(&self, request: &RpcRequest) -> ZeroResult<Value> {
        self.provider
            .request::<_, Value>(&request.method, request.params.clone())
            .await
            .map_err(|e| map_provider_error(NAME, e))
    }
}

/// Normalize one indexer output entry
///
/// Accepts `txid`/`tx_hash`, `vout`/`output_no`/`output_index`, `confirmations` and
/// `value` (satoshis).
pub fn normalize_utxo(entry: &Value) -> ZeroResult<Utxo> {
    let txid = entry
        .get("txid")
        .or_else(|| entry.get("tx_hash"))
        .and_then(Value::as_str)
        .ok_or_else(|| ZeroError::Encoding(format!("UTXO without txid: {}", entry)))?;
    let tx_hash: H256 = format!("0x{}", txid.trim_start_matches("0x"))
        .parse()
        .map_err(|e| ZeroError::Encoding(format!("Bad txid {}: {}", txid, e)))?;

    let output_index = ["vout", "output_no", "output_index"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_u64))
        .ok_or_else(|| ZeroError::Encoding(format!("UTXO without output index: {}", entry)))?;

    let confirmations = entry
        .get("confirmations")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let value = entry.get("value").and_then(Value::as_u64).unwrap_or(0);

    Ok(Utxo {
        tx_hash,
        output_index: to_u32("output index", output_index)?,
        confirmations: to_u32("confirmations", confirmations)?,
        value,
    })
}

fn to_u32(field: &str, value: u64) -> ZeroResult<u32> {
    u32::try_from(value).map_err(|_| ZeroError::Encoding(format!("UTXO {} {} out of range", field, value)))
}

#[async_trait]
impl Backend for BitcoinBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["btc"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let raw = self.raw(request).await?;

        if request.method != "btc_getUTXOs" {
            return Ok(raw);
        }

        let entries = raw
            .as_array()
            .ok_or_else(|| ZeroError::Encoding("btc_getUTXOs did not return a list".into()))?;
        let utxos = entries
            .iter()
            .map(normalize_utxo)
            .collect::<ZeroResult<Vec<_>>>()?;

        debug!("Indexer returned {} UTXOs", utxos.len());
        Ok(serde_json::to_value(utxos)?)
    }
}
