//! Fixtures and in-memory chain doubles shared by unit tests

use crate::backend::{AttestationStatus, Backend, ZeroBackend};
use crate::contracts::{BorrowProxyMade, ProxyRecord, SettlementContract, TransferEvent, TriggerParcel, TxOverrides};
use crate::driver::Driver;
use crate::error::{ZeroError, ZeroResult};
use crate::lifecycle::Zero;
use crate::pubsub::LocalChannel;
use crate::request::{Action, LiquidityRequest, LiquidityRequestParcel, NetworkParams, Utxo};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256, U64};
use ethers::utils::{hash_message, keccak256};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const BORROWER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const KEEPER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

pub fn borrower_wallet() -> LocalWallet {
    BORROWER_KEY.parse().unwrap()
}

pub fn keeper_wallet() -> LocalWallet {
    KEEPER_KEY.parse().unwrap()
}

pub fn network_params() -> NetworkParams {
    NetworkParams {
        shifter_pool: Address::repeat_byte(0x50),
        mpkh: [0x44; 20],
        borrow_proxy_code_hash: H256::repeat_byte(0x22),
        phash: H256::repeat_byte(0x33),
        btc_network: bitcoin::Network::Regtest,
        destination_chain: "Ethereum".to_string(),
    }
}

pub fn sample_request(borrower: Address) -> LiquidityRequest {
    LiquidityRequest {
        shifter_pool: network_params().shifter_pool,
        token: Address::repeat_byte(0x10),
        amount: U256::from(200_000_000u64),
        nonce: H256::repeat_byte(0x01),
        borrower,
        forbid_loan: false,
        gas_requested: U256::from(50_000_000_000_000u64),
        actions: vec![
            Action::new(Address::repeat_byte(0x61), vec![0xa9, 0x05, 0x9c, 0xbb]),
            Action::new(Address::repeat_byte(0x62), Vec::new()),
        ],
    }
}

/// Sign without a runtime; same digest and encoding as `LiquidityRequest::sign`
pub fn sign_request(request: &LiquidityRequest, wallet: &LocalWallet) -> LiquidityRequestParcel {
    let signature = wallet
        .sign_hash(hash_message(request.digest().as_bytes()))
        .unwrap();
    LiquidityRequestParcel::new(request.clone(), signature, &network_params()).unwrap()
}

pub fn sample_parcel() -> LiquidityRequestParcel {
    let wallet = borrower_wallet();
    sign_request(&sample_request(wallet.address()), &wallet)
}

pub fn utxo(tx_byte: u8, confirmations: u32, value: u64) -> Utxo {
    Utxo {
        tx_hash: H256::repeat_byte(tx_byte),
        output_index: 0,
        confirmations,
        value,
    }
}

type Override = Box<dyn Fn(&RpcRequest) -> Option<ZeroResult<Value>> + Send + Sync>;

/// Settlement chain double that records every call
pub struct RecordingBackend {
    account: Address,
    calls: Mutex<Vec<RpcRequest>>,
    respond: Option<Override>,
    sent: AtomicU64,
}

impl RecordingBackend {
    pub fn ethereum(account: Address) -> Self {
        Self {
            account,
            calls: Mutex::new(Vec::new()),
            respond: None,
            sent: AtomicU64::new(0),
        }
    }

    /// Answer from `respond` first; `None` falls back to the defaults
    pub fn ethereum_with<F>(account: Address, respond: F) -> Self
    where
        F: Fn(&RpcRequest) -> Option<ZeroResult<Value>> + Send + Sync + 'static,
    {
        Self {
            respond: Some(Box::new(respond)),
            ..Self::ethereum(account)
        }
    }

    pub fn calls(&self) -> Vec<RpcRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_call(&self, method: &str) -> Option<RpcRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.method == method)
            .cloned()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|r| r.method == method).count()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "ethereum"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["eth", "personal", "net", "web3"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(answer) = self.respond.as_ref().and_then(|f| f(request)) {
            return answer;
        }

        Ok(match request.method.as_str() {
            "eth_accounts" => json!([self.account]),
            "eth_sendTransaction" => {
                let n = self.sent.fetch_add(1, Ordering::SeqCst);
                json!(H256::from(keccak256(n.to_be_bytes())))
            }
            "eth_getTransactionReceipt" => json!({ "status": "0x1" }),
            "eth_getLogs" => json!([]),
            "eth_call" => json!("0x"),
            "eth_blockNumber" => json!(U64::from(1)),
            _ => Value::Null,
        })
    }
}

/// Collateral chain double: UTXOs per address, counting every lookup
#[derive(Default)]
pub struct BitcoinMock {
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    polls: AtomicU32,
    unavailable: AtomicU32,
    stalled: AtomicBool,
}

impl BitcoinMock {
    pub fn deposit(&self, address: &str, utxo: Utxo) {
        self.utxos
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(utxo);
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` lookups as a transport error
    pub fn fail_next(&self, n: u32) {
        self.unavailable.store(n, Ordering::SeqCst);
    }

    /// Never answer lookups from now on
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for BitcoinMock {
    fn name(&self) -> &'static str {
        "btc"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["btc"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        if request.method != "btc_getUTXOs" {
            return Err(ZeroError::UnknownMethod {
                method: request.method.clone(),
            });
        }
        self.polls.fetch_add(1, Ordering::SeqCst);

        if self.stalled.load(Ordering::SeqCst) {
            return futures::future::pending().await;
        }

        let failing = self.unavailable.load(Ordering::SeqCst);
        if failing > 0 {
            self.unavailable.store(failing - 1, Ordering::SeqCst);
            return Err(ZeroError::BackendUnavailable {
                backend: "btc".into(),
                message: "indexer timeout".into(),
            });
        }

        let address = request.first_param().and_then(Value::as_str).unwrap_or_default();
        let utxos = self.utxos.lock().unwrap().get(address).cloned().unwrap_or_default();
        Ok(serde_json::to_value(utxos)?)
    }
}

/// How the attestation double answers queries for submitted requests
#[derive(Debug, Clone)]
pub enum AttestationMode {
    Sign(Bytes),
    Hold,
    Reject(String),
}

/// Attestation network double
pub struct RenVmMock {
    mode: Mutex<AttestationMode>,
    submitted: Mutex<HashSet<String>>,
    submissions: AtomicU32,
}

impl RenVmMock {
    pub fn new(mode: AttestationMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            submitted: Mutex::new(HashSet::new()),
            submissions: AtomicU32::new(0),
        }
    }

    pub fn set_mode(&self, mode: AttestationMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Calls to `ren_submitTx`, including repeats
    pub fn submissions(&self) -> u32 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn distinct_requests(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for RenVmMock {
    fn name(&self) -> &'static str {
        "renvm"
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["ren"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let first = request.first_param().cloned().unwrap_or(Value::Null);

        match request.method.as_str() {
            "ren_submitTx" => {
                let hash = first
                    .get("hash")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ZeroError::InvalidRequest("payload without hash".into()))?
                    .to_string();
                self.submissions.fetch_add(1, Ordering::SeqCst);
                self.submitted.lock().unwrap().insert(hash.clone());
                Ok(json!(hash))
            }
            "ren_queryTx" => {
                let id = first.as_str().unwrap_or_default();
                let status = if !self.submitted.lock().unwrap().contains(id) {
                    AttestationStatus::Pending
                } else {
                    match self.mode.lock().unwrap().clone() {
                        AttestationMode::Sign(signature) => AttestationStatus::Signed { signature },
                        AttestationMode::Hold => AttestationStatus::Pending,
                        AttestationMode::Reject(reason) => AttestationStatus::Failed { reason },
                    }
                };
                Ok(serde_json::to_value(status)?)
            }
            other => Err(ZeroError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}

struct Loan {
    raw: Bytes,
    token: Address,
    amount: U256,
    timeout_expiry: U256,
    settled: bool,
}

#[derive(Default)]
struct Ledger {
    block: u64,
    loans: HashMap<Address, Loan>,
    events: Vec<BorrowProxyMade>,
    transfers: Vec<TransferEvent>,
    repaid: u32,
    defaulted: u32,
}

impl Ledger {
    /// Create the proxy for `parcel` in a new block
    fn open_loan(&mut self, parcel: &LiquidityRequestParcel, keeper: Address, bond: U256, timeout_expiry: U256) {
        let proxy = parcel.proxy_address();
        let raw = ProxyRecord::for_borrow(&parcel.request, keeper, bond, timeout_expiry).encode();
        self.block += 1;

        self.loans.insert(
            proxy,
            Loan {
                raw: raw.clone(),
                token: parcel.request.token,
                amount: parcel.request.amount,
                timeout_expiry,
                settled: false,
            },
        );
        self.events.push(BorrowProxyMade {
            user: parcel.request.borrower,
            proxy_address: proxy,
            record: raw,
            block_number: Some(self.block),
        });
    }
}

/// In-memory settlement contract enforcing the loan rules
pub struct MockSettlement {
    keeper: Address,
    ledger: Mutex<Ledger>,
}

impl MockSettlement {
    pub fn new(keeper: Address) -> Self {
        Self {
            keeper,
            ledger: Mutex::new(Ledger {
                block: 100,
                ..Ledger::default()
            }),
        }
    }

    pub fn advance_blocks(&self, n: u64) {
        self.ledger.lock().unwrap().block += n;
    }

    pub fn block(&self) -> u64 {
        self.ledger.lock().unwrap().block
    }

    pub fn events(&self) -> Vec<BorrowProxyMade> {
        self.ledger.lock().unwrap().events.clone()
    }

    pub fn repaid(&self) -> u32 {
        self.ledger.lock().unwrap().repaid
    }

    pub fn defaulted(&self) -> u32 {
        self.ledger.lock().unwrap().defaulted
    }

    /// A borrow for `parcel` executed by some other keeper
    pub fn foreign_borrow(&self, parcel: &LiquidityRequestParcel, keeper: Address, timeout_expiry: U256) {
        self.ledger
            .lock()
            .unwrap()
            .open_loan(parcel, keeper, U256::from(1u64), timeout_expiry);
    }

    fn tx_hash(ledger: &Ledger, proxy: Address) -> H256 {
        let mut seed = proxy.as_bytes().to_vec();
        seed.extend(ledger.block.to_be_bytes());
        seed.extend((ledger.repaid + ledger.defaulted).to_be_bytes());
        H256::from(keccak256(seed))
    }
}

#[async_trait]
impl SettlementContract for MockSettlement {
    async fn execute_borrow(
        &self,
        parcel: &LiquidityRequestParcel,
        bond: U256,
        timeout_expiry: U256,
        overrides: &TxOverrides,
    ) -> ZeroResult<H256> {
        parcel.signature().ok_or(ZeroError::SigningUnavailable)?;
        let proxy = parcel.proxy_address();
        let mut ledger = self.ledger.lock().unwrap();

        if ledger.loans.contains_key(&proxy) {
            return Err(ZeroError::Rpc {
                code: 3,
                message: "executeBorrow reverted: proxy exists".into(),
            });
        }

        ledger.open_loan(parcel, overrides.from.unwrap_or(self.keeper), bond, timeout_expiry);
        Ok(Self::tx_hash(&ledger, proxy))
    }

    async fn repay_loan(&self, proxy: Address, trigger: &TriggerParcel, _overrides: &TxOverrides) -> ZeroResult<H256> {
        let mut ledger = self.ledger.lock().unwrap();
        let reject = |reason: &str| ZeroError::RepaymentRejected {
            proxy: format!("{:?}", proxy),
            reason: reason.to_string(),
        };

        let loan = ledger.loans.get_mut(&proxy).ok_or_else(|| reject("unknown proxy"))?;
        if loan.settled {
            return Err(reject("loan already settled"));
        }
        if loan.raw != trigger.record {
            return Err(reject("record mismatch"));
        }
        if trigger.darknode_signature.is_empty() {
            return Err(reject("missing attestation signature"));
        }

        // Repayment mints the attested collateral to the proxy
        loan.settled = true;
        let (token, value) = (loan.token, loan.amount);
        let mint = TransferEvent {
            token,
            from: Address::zero(),
            to: proxy,
            value,
            block_number: Some(ledger.block),
            transaction_hash: None,
        };
        ledger.transfers.push(mint);
        ledger.repaid += 1;
        Ok(Self::tx_hash(&ledger, proxy))
    }

    async fn default_loan(&self, proxy: Address, record: &Bytes, _overrides: &TxOverrides) -> ZeroResult<H256> {
        let mut ledger = self.ledger.lock().unwrap();
        let block = ledger.block;
        let reject = |reason: &str| ZeroError::DefaultRejected {
            proxy: format!("{:?}", proxy),
            reason: reason.to_string(),
        };

        let loan = ledger.loans.get_mut(&proxy).ok_or_else(|| reject("unknown proxy"))?;
        if loan.settled {
            return Err(reject("loan already settled"));
        }
        if &loan.raw != record {
            return Err(reject("record mismatch"));
        }
        if U256::from(block) <= loan.timeout_expiry {
            return Err(reject("loan not expired"));
        }

        loan.settled = true;
        ledger.defaulted += 1;
        Ok(Self::tx_hash(&ledger, proxy))
    }

    async fn borrow_proxies(&self, borrower: Option<Address>, from_block: u64) -> ZeroResult<Vec<BorrowProxyMade>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.block_number.unwrap_or(0) >= from_block)
            .filter(|e| borrower.map_or(true, |b| b == e.user))
            .cloned()
            .collect())
    }

    async fn genesis(&self) -> ZeroResult<u64> {
        Ok(0)
    }

    async fn latest_block(&self) -> ZeroResult<u64> {
        Ok(self.block())
    }

    async fn transfers(&self, proxy: Address, from_block: u64) -> ZeroResult<Vec<TransferEvent>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .transfers
            .iter()
            .filter(|t| t.block_number.unwrap_or(0) >= from_block)
            .filter(|t| t.from == proxy || t.to == proxy)
            .cloned()
            .collect())
    }
}

/// One simulated deployment: shared chains, shared signaling channel
pub struct World {
    pub eth: Arc<RecordingBackend>,
    pub btc: Arc<BitcoinMock>,
    pub renvm: Arc<RenVmMock>,
    pub settlement: Arc<MockSettlement>,
    pub channel: Arc<LocalChannel>,
}

impl World {
    pub fn new() -> Self {
        Self::with_settlement_chain(RecordingBackend::ethereum(keeper_wallet().address()))
    }

    /// World whose raw settlement chain calls are answered by `eth`
    pub fn with_settlement_chain(eth: RecordingBackend) -> Self {
        let keeper = keeper_wallet().address();
        Self {
            eth: Arc::new(eth),
            btc: Arc::new(BitcoinMock::default()),
            renvm: Arc::new(RenVmMock::new(AttestationMode::Sign(vec![0x5a; 65].into()))),
            settlement: Arc::new(MockSettlement::new(keeper)),
            channel: Arc::new(LocalChannel::new()),
        }
    }

    /// A party with its own driver and proxy selection over the shared chains
    pub fn client(&self, signer: Option<LocalWallet>) -> Arc<Zero> {
        let zero_backend = Arc::new(ZeroBackend::new(self.channel.clone()));
        let backends: Vec<Arc<dyn Backend>> = vec![
            self.eth.clone(),
            self.btc.clone(),
            self.renvm.clone(),
            zero_backend.clone(),
        ];
        let driver = Arc::new(Driver::new(backends).unwrap());

        let mut zero = Zero::new(driver, zero_backend, self.settlement.clone(), network_params());
        if let Some(signer) = signer {
            zero = zero.with_signer(signer);
        }
        Arc::new(zero)
    }
}
