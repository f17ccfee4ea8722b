//! Liquidity requests and the parcels built from them
//!
//! A [`LiquidityRequest`] is immutable once constructed. Signing it yields a
//! [`LiquidityRequestParcel`], which caches the deposit address every party can
//! recompute on its own. A parcel whose deposit has been observed with enough
//! confirmations becomes a [`DepositedParcel`].

pub mod attestation;
pub mod deposit;

pub use attestation::AttestationRequest;
pub use deposit::{derive_deposit_address, predicted_proxy, NetworkParams};

use crate::error::{ZeroError, ZeroResult};

use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// One call the borrow proxy performs with the borrowed funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub to: Address,
    pub calldata: Bytes,
}

impl Action {
    pub fn new(to: Address, calldata: impl Into<Bytes>) -> Self {
        Self {
            to,
            calldata: calldata.into(),
        }
    }

    fn token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.to),
            Token::Bytes(self.calldata.to_vec()),
        ])
    }
}

pub(crate) fn actions_token(actions: &[Action]) -> Token {
    Token::Array(actions.iter().map(Action::token).collect())
}

/// Borrower's intent to deposit `amount` of collateral and borrow against it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityRequest {
    pub shifter_pool: Address,
    pub token: Address,
    pub amount: U256,
    pub nonce: H256,
    pub borrower: Address,
    pub forbid_loan: bool,
    pub gas_requested: U256,
    pub actions: Vec<Action>,
}

impl LiquidityRequest {
    /// Salt of the borrow proxy's deterministic deployment
    pub fn salt(&self) -> H256 {
        keccak256(abi::encode(&[
            Token::Address(self.borrower),
            Token::Address(self.token),
            Token::FixedBytes(self.nonce.as_bytes().to_vec()),
            Token::Uint(self.amount),
            Token::Uint(self.gas_requested),
            Token::Bool(self.forbid_loan),
            actions_token(&self.actions),
        ]))
        .into()
    }

    /// Digest the borrower signs; binds the request to one shifter pool
    pub fn digest(&self) -> H256 {
        keccak256(abi::encode(&[
            Token::Address(self.shifter_pool),
            Token::Address(self.token),
            Token::FixedBytes(self.nonce.as_bytes().to_vec()),
            Token::Uint(self.amount),
            Token::Uint(self.gas_requested),
            Token::Bool(self.forbid_loan),
            actions_token(&self.actions),
        ]))
        .into()
    }

    /// Sign with the borrower's key
    pub async fn sign(&self, signer: &LocalWallet) -> ZeroResult<Signature> {
        if signer.address() != self.borrower {
            return Err(ZeroError::InvalidRequest(format!(
                "request borrower {:?} is not the signer {:?}",
                self.borrower,
                signer.address()
            )));
        }

        signer
            .sign_message(self.digest().as_bytes())
            .await
            .map_err(|e| ZeroError::Internal(format!("signing failed: {}", e)))
    }

    /// Address that produced `signature` over this request's digest
    pub fn recover_signer(&self, signature: &Signature) -> ZeroResult<Address> {
        signature
            .recover(self.digest().as_bytes().to_vec())
            .map_err(|e| ZeroError::InvalidRequest(format!("unrecoverable signature: {}", e)))
    }
}

/// Observed collateral output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub tx_hash: H256,
    pub output_index: u32,
    pub confirmations: u32,
    /// Satoshis
    #[serde(default)]
    pub value: u64,
}

/// Signed liquidity request with its cached deposit address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityRequestParcel {
    pub request: LiquidityRequest,
    /// Absent when rebuilt from an on-chain record
    #[serde(default)]
    signature: Option<Signature>,
    deposit_address: String,
    proxy_address: Address,
}

impl LiquidityRequestParcel {
    /// Bind a signature to a request, verifying the borrower signed it
    pub fn new(
        request: LiquidityRequest,
        signature: Signature,
        params: &NetworkParams,
    ) -> ZeroResult<Self> {
        let signer = request.recover_signer(&signature)?;
        if signer != request.borrower {
            return Err(ZeroError::InvalidRequest(format!(
                "signature from {:?} does not match borrower {:?}",
                signer, request.borrower
            )));
        }

        let mut parcel = Self::from_record(request, params)?;
        parcel.signature = Some(signature);
        Ok(parcel)
    }

    /// Parcel for a request already accepted on chain, where the signature was
    /// checked by the settlement contract and is not retained
    pub fn from_record(request: LiquidityRequest, params: &NetworkParams) -> ZeroResult<Self> {
        let deposit_address = derive_deposit_address(&request, params)?;
        let proxy_address = predicted_proxy(&request, params);

        Ok(Self {
            request,
            signature: None,
            deposit_address,
            proxy_address,
        })
    }

    /// Rebuild a parcel from a broadcast message, recovering the borrower
    pub fn from_message(message: &LiquidityRequestMessage, params: &NetworkParams) -> ZeroResult<Self> {
        let signature = Signature::try_from(message.signature.as_ref())
            .map_err(|e| ZeroError::InvalidRequest(format!("malformed signature: {}", e)))?;

        let mut request = LiquidityRequest {
            shifter_pool: message.shifter_pool,
            token: message.token,
            amount: message.amount,
            nonce: message.nonce,
            borrower: Address::zero(),
            forbid_loan: message.forbid_loan,
            gas_requested: message.gas_requested,
            actions: message.actions.clone(),
        };
        request.borrower = request.recover_signer(&signature)?;

        Self::new(request, signature, params)
    }

    pub fn deposit_address(&self) -> &str {
        &self.deposit_address
    }

    /// Address the borrow proxy for this request will be deployed at
    pub fn proxy_address(&self) -> Address {
        self.proxy_address
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn to_message(&self) -> ZeroResult<LiquidityRequestMessage> {
        let signature = self.signature.as_ref().ok_or(ZeroError::SigningUnavailable)?;
        Ok(LiquidityRequestMessage {
            shifter_pool: self.request.shifter_pool,
            token: self.request.token,
            amount: self.request.amount,
            nonce: self.request.nonce,
            actions: self.request.actions.clone(),
            forbid_loan: self.request.forbid_loan,
            gas_requested: self.request.gas_requested,
            signature: signature.to_vec().into(),
        })
    }
}

/// Wire form of a parcel on the pub/sub channel
///
/// The borrower is not carried; receivers recover it from the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityRequestMessage {
    pub shifter_pool: Address,
    pub token: Address,
    pub amount: U256,
    pub nonce: H256,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub forbid_loan: bool,
    pub gas_requested: U256,
    pub signature: Bytes,
}

/// Parcel whose collateral output has been observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositedParcel {
    pub parcel: LiquidityRequestParcel,
    pub utxo: Utxo,
}

impl DepositedParcel {
    /// Pair a parcel with its deposit; rejects outputs below the threshold
    pub fn new(parcel: LiquidityRequestParcel, utxo: Utxo, threshold: u32) -> ZeroResult<Self> {
        if utxo.confirmations < threshold {
            return Err(ZeroError::InvalidRequest(format!(
                "deposit {:?}:{} has {} confirmations, need {}",
                utxo.tx_hash, utxo.output_index, utxo.confirmations, threshold
            )));
        }
        Ok(Self { parcel, utxo })
    }

    pub fn request(&self) -> &LiquidityRequest {
        &self.parcel.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{borrower_wallet, network_params, sample_request};

    #[tokio::test]
    async fn test_sign_and_recover() {
        let wallet = borrower_wallet();
        let request = sample_request(wallet.address());

        let signature = request.sign(&wallet).await.unwrap();
        assert_eq!(request.recover_signer(&signature).unwrap(), wallet.address());

        let parcel = LiquidityRequestParcel::new(request, signature, &network_params()).unwrap();
        assert!(!parcel.deposit_address().is_empty());
    }

    #[tokio::test]
    async fn test_sign_rejects_foreign_borrower() {
        let wallet = borrower_wallet();
        let request = sample_request(Address::repeat_byte(0x99));

        let err = request.sign(&wallet).await.unwrap_err();
        assert!(matches!(err, ZeroError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_message_round_trip_recovers_borrower() {
        let wallet = borrower_wallet();
        let request = sample_request(wallet.address());
        let signature = request.sign(&wallet).await.unwrap();
        let parcel = LiquidityRequestParcel::new(request, signature, &network_params()).unwrap();

        let wire = serde_json::to_value(parcel.to_message().unwrap()).unwrap();
        assert!(wire.get("borrower").is_none());
        assert!(wire.get("gasRequested").is_some());

        let message: LiquidityRequestMessage = serde_json::from_value(wire).unwrap();
        let received = LiquidityRequestParcel::from_message(&message, &network_params()).unwrap();
        assert_eq!(received, parcel);
    }

    #[tokio::test]
    async fn test_tampered_message_changes_borrower() {
        let wallet = borrower_wallet();
        let request = sample_request(wallet.address());
        let signature = request.sign(&wallet).await.unwrap();
        let parcel = LiquidityRequestParcel::new(request, signature, &network_params()).unwrap();

        let mut message = parcel.to_message().unwrap();
        message.amount += U256::one();

        // Recovery still yields some address, just not the original borrower
        let received = LiquidityRequestParcel::from_message(&message, &network_params()).unwrap();
        assert_ne!(received.request.borrower, wallet.address());
        assert_ne!(received.deposit_address(), parcel.deposit_address());
    }

    #[test]
    fn test_deposited_parcel_threshold() {
        let parcel = crate::testing::sample_parcel();
        let utxo = Utxo {
            tx_hash: H256::repeat_byte(1),
            output_index: 0,
            confirmations: 5,
            value: 200_000_000,
        };

        assert!(DepositedParcel::new(parcel.clone(), utxo, 6).is_err());
        let deposited = DepositedParcel::new(parcel, Utxo { confirmations: 6, ..utxo }, 6).unwrap();
        assert!(deposited.utxo.confirmations >= 6);
    }
}
