//! Attestation network mint requests

use super::DepositedParcel;
use super::NetworkParams;

use ethers::abi::{self, Token};
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use serde_json::{json, Value};

/// A mint request keyed by the deposit it spends
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationRequest {
    /// Deterministic request hash, `0x`-prefixed
    pub id: String,
    pub payload: Value,
}

/// Mint selector for collateral moving to `destination_chain`
pub fn mint_selector(destination_chain: &str) -> String {
    format!("BTC/to{}", destination_chain)
}

impl AttestationRequest {
    /// Build the request for a deposited parcel
    ///
    /// The id only depends on the request fields and the UTXO, so a resubmission of
    /// the same deposit yields the same id.
    pub fn build(deposited: &DepositedParcel, params: &NetworkParams) -> Self {
        let request = deposited.request();
        let utxo = &deposited.utxo;
        let selector = mint_selector(&params.destination_chain);
        let to = deposited.parcel.proxy_address();

        let id = H256::from(keccak256(abi::encode(&[
            Token::String(selector.clone()),
            Token::FixedBytes(params.phash.as_bytes().to_vec()),
            Token::Address(request.token),
            Token::Address(to),
            Token::FixedBytes(request.nonce.as_bytes().to_vec()),
            Token::FixedBytes(utxo.tx_hash.as_bytes().to_vec()),
            Token::Uint(U256::from(utxo.output_index)),
        ])));
        let id = format!("{:?}", id);

        let payload = json!({
            "hash": id,
            "selector": selector,
            "in": {
                "phash": params.phash,
                "token": request.token,
                "to": to,
                "n": request.nonce,
                "utxo": {
                    "txHash": utxo.tx_hash,
                    "vOut": utxo.output_index,
                },
            },
        });

        Self { id, payload }
    }
}
