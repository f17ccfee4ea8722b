//! Loan lifecycle: the client context and one transition method per state change
//!
//! ```text
//! Created --sign--> Parceled --broadcast--> received by keepers
//! Parceled --wait_for_deposit--> Deposited --submit--> AttestationPending
//! AttestationPending --wait_for_signature--> Attested
//! Deposited/Attested --execute_borrow--> Borrowed --repay--> Repaid
//! Borrowed --default after expiry--> Defaulted
//! ```
//!
//! Every transition reads its inputs from the parcel and from chain state, so calling
//! it again after a restart observes the same result instead of repeating work.

pub mod poll;
pub mod state;
pub mod subscription;

#[cfg(test)]
mod scenarios;

pub use poll::{poll_until, RetryPolicy};
pub use state::{LoanOutcome, LoanProgress, LoanState};
pub use subscription::{BorrowSubscription, LiquidityRequestSubscription, Subscription};

use crate::backend::{
    ActiveProxy, AttestationStatus, Backend, BitcoinBackend, EthereumBackend, RenVmBackend, ZeroBackend,
};
use crate::config::Settings;
use crate::contracts::{SettlementContract, ShifterPool, TxOverrides};
use crate::driver::{BorrowProxyInterceptor, Driver};
use crate::error::{ZeroError, ZeroResult};
use crate::proxy::BorrowProxy;
use crate::pubsub::PubSub;
use crate::request::{
    Action, AttestationRequest, DepositedParcel, LiquidityRequest, LiquidityRequestParcel, NetworkParams, Utxo,
};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default confirmations a deposit needs before it counts
pub const DEFAULT_CONFIRMATIONS: u32 = 6;

/// Which qualifying UTXO a deposit wait settles on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoSelection {
    /// First qualifying output in backend order
    #[default]
    First,
    LargestValue,
}

impl UtxoSelection {
    pub fn select(&self, utxos: &[Utxo]) -> Option<Utxo> {
        match self {
            UtxoSelection::First => utxos.first().copied(),
            // max_by_key keeps the last maximum; scan in reverse so ties favor backend order
            UtxoSelection::LargestValue => utxos.iter().rev().max_by_key(|u| u.value).copied(),
        }
    }
}

/// Fields of a new liquidity request
#[derive(Debug, Clone, Default)]
pub struct NewLiquidityRequest {
    pub token: Address,
    pub amount: U256,
    pub nonce: H256,
    /// Defaults to the bound signer
    pub borrower: Option<Address>,
    pub forbid_loan: bool,
    pub gas_requested: U256,
    pub actions: Vec<Action>,
}

/// Client context shared by borrowers and keepers
pub struct Zero {
    driver: Arc<Driver>,
    params: NetworkParams,
    signer: Option<LocalWallet>,
    zero_backend: Arc<ZeroBackend>,
    settlement: Arc<dyn SettlementContract>,
    confirmations: u32,
    utxo_selection: UtxoSelection,
    shutdown: CancellationToken,
}

impl Zero {
    pub fn new(
        driver: Arc<Driver>,
        zero_backend: Arc<ZeroBackend>,
        settlement: Arc<dyn SettlementContract>,
        params: NetworkParams,
    ) -> Self {
        Self {
            driver,
            params,
            signer: None,
            zero_backend,
            settlement,
            confirmations: DEFAULT_CONFIRMATIONS,
            utxo_selection: UtxoSelection::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a context with live backends from configuration
    pub fn from_settings(
        settings: &Settings,
        signer: Option<LocalWallet>,
        channel: Arc<dyn PubSub>,
    ) -> ZeroResult<Self> {
        let params = NetworkParams::from_settings(settings)?;
        let zero_backend = Arc::new(ZeroBackend::new(channel));

        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(EthereumBackend::new(&settings.ethereum, signer.clone())?),
            Arc::new(BitcoinBackend::new(&settings.bitcoin)?),
            Arc::new(RenVmBackend::new(&settings.attestation)?),
            zero_backend.clone(),
        ];
        let driver = Arc::new(Driver::new(backends)?);
        let settlement = Arc::new(ShifterPool::new(driver.clone(), params.shifter_pool));

        let mut zero = Self::new(driver, zero_backend, settlement, params)
            .with_confirmations(settings.keeper.required_confirmations)
            .with_utxo_selection(settings.keeper.utxo_selection);
        if let Some(signer) = signer {
            zero = zero.with_signer(signer);
        }
        Ok(zero)
    }

    pub fn with_signer(mut self, signer: LocalWallet) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn with_utxo_selection(mut self, selection: UtxoSelection) -> Self {
        self.utxo_selection = selection;
        self
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn settlement(&self) -> Arc<dyn SettlementContract> {
        self.settlement.clone()
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    /// Cancelled on [`Zero::shutdown`]; parent of every subscription
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stop every subscription created from this context
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn create_liquidity_request(&self, fields: NewLiquidityRequest) -> ZeroResult<LiquidityRequest> {
        let borrower = fields
            .borrower
            .or_else(|| self.signer_address())
            .ok_or(ZeroError::SigningUnavailable)?;

        Ok(LiquidityRequest {
            shifter_pool: self.params.shifter_pool,
            token: fields.token,
            amount: fields.amount,
            nonce: fields.nonce,
            borrower,
            forbid_loan: fields.forbid_loan,
            gas_requested: fields.gas_requested,
            actions: fields.actions,
        })
    }

    /// Sign a request into a parcel with the bound signer
    pub async fn sign(&self, request: LiquidityRequest) -> ZeroResult<LiquidityRequestParcel> {
        let signer = self.signer.as_ref().ok_or(ZeroError::SigningUnavailable)?;
        let signature = request.sign(signer).await?;
        LiquidityRequestParcel::new(request, signature, &self.params)
    }

    /// Publish a parcel on the signaling channel
    pub async fn broadcast(&self, parcel: &LiquidityRequestParcel) -> ZeroResult<()> {
        let message = serde_json::to_value(parcel.to_message()?)?;
        self.driver
            .send_wrapped("0cf_broadcastLiquidityRequest", vec![message])
            .await?;
        info!("Broadcast liquidity request for {}", parcel.deposit_address());
        Ok(())
    }

    /// Parcels for our shifter pool arriving on the signaling channel
    pub fn listen_for_liquidity_requests(&self) -> LiquidityRequestSubscription {
        subscription::liquidity_requests(self, self.zero_backend.subscribe_liquidity_requests())
    }

    /// UTXOs at the parcel's deposit address that meet the confirmation threshold
    pub async fn qualifying_utxos(&self, parcel: &LiquidityRequestParcel) -> ZeroResult<Vec<Utxo>> {
        let raw = self
            .driver
            .send_wrapped(
                "btc_getUTXOs",
                vec![json!(parcel.deposit_address()), json!(self.confirmations)],
            )
            .await?;
        let utxos: Vec<Utxo> = serde_json::from_value(raw)?;

        Ok(utxos
            .into_iter()
            .filter(|u| u.confirmations >= self.confirmations)
            .collect())
    }

    /// Poll until the parcel's deposit has enough confirmations
    pub async fn wait_for_deposit(
        &self,
        parcel: &LiquidityRequestParcel,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ZeroResult<DepositedParcel> {
        debug!("Waiting for deposit to {}", parcel.deposit_address());

        let utxo = poll_until("deposit", policy, cancel, move || async move {
            let utxos = self.qualifying_utxos(parcel).await?;
            Ok(self.utxo_selection.select(&utxos))
        })
        .await?;

        info!(
            "Deposit {:?}:{} confirmed for {}",
            utxo.tx_hash,
            utxo.output_index,
            parcel.deposit_address()
        );
        DepositedParcel::new(parcel.clone(), utxo, self.confirmations)
    }

    /// Submit the mint request for a deposit; returns its deterministic id
    pub async fn submit_to_attestation_network(&self, deposited: &DepositedParcel) -> ZeroResult<String> {
        let request = AttestationRequest::build(deposited, &self.params);
        self.driver
            .send_wrapped("ren_submitTx", vec![request.payload])
            .await?;
        Ok(request.id)
    }

    pub async fn attestation_status(&self, deposited: &DepositedParcel) -> ZeroResult<AttestationStatus> {
        let id = AttestationRequest::build(deposited, &self.params).id;
        let raw = self.driver.send_wrapped("ren_queryTx", vec![json!(id)]).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Poll until the attestation network signs or rejects the deposit
    pub async fn wait_for_signature(
        &self,
        deposited: &DepositedParcel,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> ZeroResult<Bytes> {
        let id = &AttestationRequest::build(deposited, &self.params).id;

        poll_until("attestation signature", policy, cancel, move || async move {
            match self.attestation_status(deposited).await? {
                AttestationStatus::Signed { signature } => Ok(Some(signature)),
                AttestationStatus::Pending => Ok(None),
                AttestationStatus::Failed { reason } => Err(ZeroError::AttestationFailed {
                    request_id: id.clone(),
                    reason,
                }),
            }
        })
        .await
    }

    /// Execute the borrow for a deposited parcel, creating its proxy
    pub async fn execute_borrow(
        &self,
        deposited: &DepositedParcel,
        bond: U256,
        timeout_expiry: U256,
        overrides: &TxOverrides,
    ) -> ZeroResult<H256> {
        self.settlement
            .execute_borrow(&deposited.parcel, bond, timeout_expiry, overrides)
            .await
    }

    async fn default_borrower(&self) -> ZeroResult<Address> {
        if let Some(address) = self.signer_address() {
            return Ok(address);
        }
        let accounts = self.driver.send_unwrapped("eth_accounts", vec![]).await?;
        let accounts: Vec<Address> = serde_json::from_value(accounts)?;
        accounts.first().copied().ok_or(ZeroError::SigningUnavailable)
    }

    /// Every borrow proxy ever created for `borrower` (default: our own account)
    pub async fn get_borrow_proxies(self: &Arc<Self>, borrower: Option<Address>) -> ZeroResult<Vec<BorrowProxy>> {
        let borrower = match borrower {
            Some(b) => b,
            None => self.default_borrower().await?,
        };
        let genesis = self.settlement.genesis().await?;

        self.settlement
            .borrow_proxies(Some(borrower), genesis)
            .await?
            .iter()
            .map(|event| BorrowProxy::from_event(self.clone(), event))
            .collect()
    }

    /// Stream of borrow proxies created from now on; `None` follows every borrower
    pub async fn subscribe_borrows(
        self: &Arc<Self>,
        borrower: Option<Address>,
        policy: RetryPolicy,
    ) -> ZeroResult<BorrowSubscription> {
        let from_block = self.settlement.latest_block().await?;
        Ok(subscription::borrows(self.clone(), borrower, from_block, policy))
    }

    /// The borrow proxy created for a parcel, if the borrow has executed
    pub async fn find_borrow_proxy(self: &Arc<Self>, parcel: &LiquidityRequestParcel) -> ZeroResult<Option<BorrowProxy>> {
        let genesis = self.settlement.genesis().await?;
        let target = parcel.proxy_address();

        let event = self
            .settlement
            .borrow_proxies(Some(parcel.request.borrower), genesis)
            .await?
            .into_iter()
            .find(|event| event.proxy_address == target);

        event
            .map(|event| BorrowProxy::from_event(self.clone(), &event))
            .transpose()
    }

    /// Route settlement chain activity through `proxy`
    pub async fn set_borrow_proxy(&self, proxy: &BorrowProxy) -> ZeroResult<()> {
        let active = ActiveProxy {
            address: proxy.address(),
            borrower: proxy.borrower(),
        };
        self.driver
            .send_wrapped("0cf_setBorrowProxy", vec![serde_json::to_value(active)?])
            .await?;
        self.driver
            .install_interceptor(
                "ethereum",
                Arc::new(BorrowProxyInterceptor::new(self.zero_backend.selection())),
            )
            .await
    }

    /// Stop routing through a borrow proxy
    pub async fn clear_borrow_proxy(&self) -> ZeroResult<()> {
        self.driver.uninstall_interceptor("ethereum").await?;
        self.driver.send_wrapped("0cf_clearBorrowProxy", vec![]).await?;
        Ok(())
    }

    fn pool(&self) -> ShifterPool {
        ShifterPool::new(self.driver.clone(), self.params.shifter_pool)
    }

    // Liquidity provision

    pub async fn approve_pool(&self, token: Address, overrides: &TxOverrides) -> ZeroResult<H256> {
        self.pool().approve_pool(token, overrides).await
    }

    pub async fn get_liquidity_token_for(&self, token: Address) -> ZeroResult<Address> {
        self.pool().liquidity_token_for(token).await
    }

    pub async fn approve_liquidity_token(&self, token: Address, overrides: &TxOverrides) -> ZeroResult<H256> {
        self.pool().approve_liquidity_token(token, overrides).await
    }

    pub async fn add_liquidity(&self, token: Address, value: U256, overrides: &TxOverrides) -> ZeroResult<H256> {
        self.pool().add_liquidity(token, value, overrides).await
    }

    pub async fn remove_liquidity(&self, token: Address, value: U256, overrides: &TxOverrides) -> ZeroResult<H256> {
        self.pool().remove_liquidity(token, value, overrides).await
    }

    /// Fetch the proxy creation code from the pool and derive proxy addresses from it
    pub async fn load_borrow_proxy_creation_code(&mut self) -> ZeroResult<H256> {
        let code = self.pool().borrow_proxy_creation_code().await?;
        let hash = H256::from(keccak256(&code));
        info!("Loaded borrow proxy creation code, hash {:?}", hash);
        self.params.borrow_proxy_code_hash = hash;
        Ok(hash)
    }
}
