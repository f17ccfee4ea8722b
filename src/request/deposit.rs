//! Deposit address derivation
//!
//! Every party derives the same address from the request fields alone, so a keeper
//! never has to trust the address a broadcaster claims:
//!
//! 1. the borrow proxy address is the CREATE2 address of the request's salt under
//!    the shifter pool and the proxy creation code hash
//! 2. `gHash = keccak256(abi.encode(pHash, token, proxy, nonce))`
//! 3. the deposit script is `<gHash> OP_DROP OP_DUP OP_HASH160 <mpkh> OP_EQUALVERIFY
//!    OP_CHECKSIG`, paid to as P2SH on the configured bitcoin network

use super::LiquidityRequest;
use crate::config::Settings;
use crate::error::{ZeroError, ZeroResult};

use bitcoin::opcodes::all::{OP_CHECKSIG, OP_DROP, OP_DUP, OP_EQUALVERIFY, OP_HASH160};
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use ethers::abi::{self, Token};
use ethers::types::{Address, H256};
use ethers::utils::{get_create2_address_from_hash, keccak256};

/// Constants of the deployed system that every derivation depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub shifter_pool: Address,
    /// Hash160 of the attestation network's public key
    pub mpkh: [u8; 20],
    pub borrow_proxy_code_hash: H256,
    pub phash: H256,
    pub btc_network: bitcoin::Network,
    pub destination_chain: String,
}

impl NetworkParams {
    pub fn from_settings(settings: &Settings) -> ZeroResult<Self> {
        let raw = hex::decode(settings.network.mpkh.trim_start_matches("0x"))
            .map_err(|e| ZeroError::Config(format!("network.mpkh: {}", e)))?;
        let mpkh: [u8; 20] = raw
            .try_into()
            .map_err(|_| ZeroError::Config("network.mpkh must be 20 bytes".into()))?;

        Ok(Self {
            shifter_pool: settings.network.shifter_pool,
            mpkh,
            borrow_proxy_code_hash: settings.network.borrow_proxy_code_hash.unwrap_or_default(),
            phash: settings.network.phash,
            btc_network: settings.bitcoin.network,
            destination_chain: settings.attestation.destination_chain.clone(),
        })
    }
}

/// Address the borrow proxy for `request` will be created at
pub fn predicted_proxy(request: &LiquidityRequest, params: &NetworkParams) -> Address {
    get_create2_address_from_hash(
        params.shifter_pool,
        request.salt().to_fixed_bytes(),
        params.borrow_proxy_code_hash.to_fixed_bytes(),
    )
}

/// Hash committed to by the deposit script
pub fn gateway_hash(request: &LiquidityRequest, params: &NetworkParams) -> H256 {
    keccak256(abi::encode(&[
        Token::FixedBytes(params.phash.as_bytes().to_vec()),
        Token::Address(request.token),
        Token::Address(predicted_proxy(request, params)),
        Token::FixedBytes(request.nonce.as_bytes().to_vec()),
    ]))
    .into()
}

/// Redeem script the deposit pays to
pub fn deposit_script(request: &LiquidityRequest, params: &NetworkParams) -> ZeroResult<ScriptBuf> {
    let ghash = push_bytes(gateway_hash(request, params).as_bytes())?;
    let mpkh = push_bytes(&params.mpkh)?;

    Ok(Builder::new()
        .push_slice(ghash)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(mpkh)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

fn push_bytes(data: &[u8]) -> ZeroResult<PushBytesBuf> {
    PushBytesBuf::try_from(data.to_vec()).map_err(|e| ZeroError::Encoding(e.to_string()))
}

/// P2SH deposit address for `request`
pub fn derive_deposit_address(request: &LiquidityRequest, params: &NetworkParams) -> ZeroResult<String> {
    let script = deposit_script(request, params)?;
    let address = bitcoin::Address::p2sh(&script, params.btc_network)
        .map_err(|e| ZeroError::Encoding(format!("deposit script: {}", e)))?;
    Ok(address.to_string())
}
