//! Typed handle to one on-chain borrow proxy

use crate::contracts::{BorrowProxyMade, ProxyRecord, TransferEvent, TriggerParcel, TxOverrides};
use crate::driver::Driver;
use crate::error::{ZeroError, ZeroResult};
use crate::lifecycle::{RetryPolicy, Zero};
use crate::request::{derive_deposit_address, DepositedParcel, LiquidityRequestParcel};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Executes read-only calls as if sent by a borrow proxy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SafeViewExecutor: Send + Sync {
    async fn query(&self, proxy: Address, to: Address, data: Bytes) -> ZeroResult<Bytes>;
}

/// `eth_call` with the proxy as sender
pub struct ProxyViewExecutor {
    driver: Arc<Driver>,
}

impl ProxyViewExecutor {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl SafeViewExecutor for ProxyViewExecutor {
    async fn query(&self, proxy: Address, to: Address, data: Bytes) -> ZeroResult<Bytes> {
        let call = json!({ "from": proxy, "to": to, "data": data });
        let raw = self
            .driver
            .send_unwrapped("eth_call", vec![call, json!("latest")])
            .await?;
        Ok(serde_json::from_value(raw)?)
    }
}

/// A loan's proxy contract and the record it was created with
pub struct BorrowProxy {
    zero: Arc<Zero>,
    proxy_address: Address,
    borrower: Address,
    record: ProxyRecord,
    raw_record: Bytes,
    executor: Arc<dyn SafeViewExecutor>,
}

impl BorrowProxy {
    pub fn from_event(zero: Arc<Zero>, event: &BorrowProxyMade) -> ZeroResult<Self> {
        let record = ProxyRecord::decode(&event.record)?;
        let executor = Arc::new(ProxyViewExecutor::new(zero.driver().clone()));

        Ok(Self {
            zero,
            proxy_address: event.proxy_address,
            borrower: event.user,
            record,
            raw_record: event.record.clone(),
            executor,
        })
    }

    /// Replace the view executor
    pub fn with_executor(mut self, executor: Arc<dyn SafeViewExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn address(&self) -> Address {
        self.proxy_address
    }

    pub fn borrower(&self) -> Address {
        self.borrower
    }

    pub fn record(&self) -> &ProxyRecord {
        &self.record
    }

    pub fn raw_record(&self) -> &Bytes {
        &self.raw_record
    }

    /// Block after which the loan may be defaulted; expiries past `u64` are never reached
    pub fn expiry_block(&self) -> u64 {
        u64::try_from(self.record.timeout_expiry).unwrap_or(u64::MAX)
    }

    /// Parcel for the request embedded in the record
    pub fn liquidity_request_parcel(&self) -> ZeroResult<LiquidityRequestParcel> {
        let params = self.zero.params();
        LiquidityRequestParcel::from_record(self.record.to_request(params.shifter_pool), params)
    }

    pub fn get_deposit_address(&self) -> ZeroResult<String> {
        let params = self.zero.params();
        derive_deposit_address(&self.record.to_request(params.shifter_pool), params)
    }

    /// Wait for the deposit, then for its attestation signature
    pub async fn wait_for_confirmed(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ZeroResult<(DepositedParcel, Bytes)> {
        let parcel = self.liquidity_request_parcel()?;
        let deposited = self.zero.wait_for_deposit(&parcel, policy, cancel).await?;
        self.zero.submit_to_attestation_network(&deposited).await?;
        let signature = self.zero.wait_for_signature(&deposited, policy, cancel).await?;
        Ok((deposited, signature))
    }

    /// Repay through the proxy once the deposit is attested
    pub async fn repay_loan(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        overrides: &TxOverrides,
    ) -> ZeroResult<H256> {
        let (deposited, signature) = self.wait_for_confirmed(policy, cancel).await?;

        let trigger = TriggerParcel {
            record: self.raw_record.clone(),
            phash: self.zero.params().phash,
            vout: deposited.utxo.output_index,
            txhash: deposited.utxo.tx_hash,
            darknode_signature: signature,
        };

        let hash = self
            .zero
            .settlement()
            .repay_loan(self.proxy_address, &trigger, overrides)
            .await?;
        crate::metrics::record_loan_settled("repaid");
        Ok(hash)
    }

    /// Reclaim the bond after expiry; the contract decides whether expiry has passed
    pub async fn default_loan(&self, overrides: &TxOverrides) -> ZeroResult<H256> {
        let hash = self
            .zero
            .settlement()
            .default_loan(self.proxy_address, &self.raw_record, overrides)
            .await?;
        info!("Defaulted loan at {:?}", self.proxy_address);
        crate::metrics::record_loan_settled("defaulted");
        Ok(hash)
    }

    /// ERC20 transfers touching the proxy, from genesis unless told otherwise
    pub async fn query_transfers(&self, from_block: Option<u64>) -> ZeroResult<Vec<TransferEvent>> {
        let settlement = self.zero.settlement();
        let from_block = match from_block {
            Some(block) => block,
            None => settlement.genesis().await?,
        };
        settlement.transfers(self.proxy_address, from_block).await
    }

    /// Whether the loan was repaid: repayment mints the attested collateral to the proxy
    pub async fn is_repaid(&self) -> ZeroResult<bool> {
        let token = self.record.token;
        Ok(self
            .query_transfers(None)
            .await?
            .iter()
            .any(|t| t.token == token && t.from == Address::zero() && t.to == self.proxy_address))
    }

    /// Read-only call executed with the proxy as sender
    pub async fn view(&self, to: Address, data: Bytes) -> ZeroResult<Bytes> {
        if to == Address::zero() {
            return Err(ZeroError::InvalidRequest("view call without target".into()));
        }
        self.executor.query(self.proxy_address, to, data).await
    }
}

impl std::fmt::Debug for BorrowProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BorrowProxy")
            .field("proxy_address", &self.proxy_address)
            .field("borrower", &self.borrower)
            .field("record", &self.record)
            .finish()
    }
}
