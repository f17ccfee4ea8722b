//! Settlement contract binding
//!
//! [`ShifterPool`] speaks raw JSON-RPC through the driver's unwrapped path, so the
//! keeper's and borrower's own contract calls are never rerouted through a borrow
//! proxy while interception is installed.

use super::record::{request_token, TriggerParcel};
use crate::driver::Driver;
use crate::error::{ZeroError, ZeroResult};
use crate::request::LiquidityRequestParcel;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use ethers::utils::{id, keccak256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const EXECUTE_BORROW: &str =
    "executeBorrow(((address,address,bytes32,uint256,bool,(address,bytes)[]),uint256,bytes),uint256,uint256)";
const REPAY_LOAN: &str = "repayLoan(bytes)";
const DEFAULT_LOAN: &str = "defaultLoan(bytes)";
const GET_GENESIS: &str = "getGenesis()";
const BORROW_PROXY_MADE: &str = "BorrowProxyMade(address,address,bytes)";
const TRANSFER: &str = "Transfer(address,address,uint256)";
const APPROVE: &str = "approve(address,uint256)";
const GET_LIQUIDITY_TOKEN_HANDLER: &str = "getLiquidityTokenHandler(address)";
const ADD_LIQUIDITY: &str = "addLiquidity(uint256)";
const REMOVE_LIQUIDITY: &str = "removeLiquidityToken(uint256)";
const GET_BORROW_PROXY_CREATION_CODE: &str = "getBorrowProxyCreationCode()";

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECEIPT_MAX_POLLS: u32 = 240;

/// Optional transaction fields applied to contract calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U256>,
}

/// Decoded `BorrowProxyMade` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowProxyMade {
    pub user: Address,
    pub proxy_address: Address,
    pub record: Bytes,
    pub block_number: Option<u64>,
}

/// ERC20 transfer touching a borrow proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<H256>,
}

/// Entry points of the on-chain settlement system
#[async_trait]
pub trait SettlementContract: Send + Sync {
    /// Create the borrow proxy for a parcel and advance the loan; pays `gasRequested`
    async fn execute_borrow(
        &self,
        parcel: &LiquidityRequestParcel,
        bond: U256,
        timeout_expiry: U256,
        overrides: &TxOverrides,
    ) -> ZeroResult<H256>;

    async fn repay_loan(&self, proxy: Address, trigger: &TriggerParcel, overrides: &TxOverrides) -> ZeroResult<H256>;

    async fn default_loan(&self, proxy: Address, record: &Bytes, overrides: &TxOverrides) -> ZeroResult<H256>;

    /// `BorrowProxyMade` events since `from_block`, optionally for one borrower
    async fn borrow_proxies(&self, borrower: Option<Address>, from_block: u64) -> ZeroResult<Vec<BorrowProxyMade>>;

    /// Deployment block of the settlement contract
    async fn genesis(&self) -> ZeroResult<u64>;

    async fn latest_block(&self) -> ZeroResult<u64>;

    /// ERC20 transfers from or to `proxy`, oldest first
    async fn transfers(&self, proxy: Address, from_block: u64) -> ZeroResult<Vec<TransferEvent>>;
}

/// Outcome of a mined (or refused) transaction
enum TxOutcome {
    Mined(H256),
    Reverted(String),
}

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature))
}

fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

fn hex_block(block: u64) -> Value {
    json!(U64::from(block))
}

/// JSON-RPC binding of the shifter pool
pub struct ShifterPool {
    driver: Arc<Driver>,
    address: Address,
    genesis: OnceCell<u64>,
}

impl ShifterPool {
    pub fn new(driver: Arc<Driver>, address: Address) -> Self {
        Self {
            driver,
            address,
            genesis: OnceCell::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    async fn sender(&self, overrides: &TxOverrides) -> ZeroResult<Address> {
        if let Some(from) = overrides.from {
            return Ok(from);
        }
        let accounts = self.driver.send_unwrapped("eth_accounts", vec![]).await?;
        let accounts: Vec<Address> = serde_json::from_value(accounts)?;
        accounts.first().copied().ok_or(ZeroError::SigningUnavailable)
    }

    /// Send a transaction and wait for its receipt
    async fn transact(&self, to: Address, data: Bytes, value: U256, overrides: &TxOverrides) -> ZeroResult<TxOutcome> {
        let mut tx = serde_json::to_value(overrides)?;
        tx["from"] = json!(self.sender(overrides).await?);
        tx["to"] = json!(to);
        tx["data"] = json!(data);
        tx["value"] = json!(value);

        let hash = match self.driver.send_unwrapped("eth_sendTransaction", vec![tx]).await {
            Ok(hash) => serde_json::from_value::<H256>(hash)?,
            Err(ZeroError::Rpc { message, .. }) => return Ok(TxOutcome::Reverted(message)),
            Err(e) => return Err(e),
        };
        debug!("Sent {:?}, waiting for receipt", hash);

        for _ in 0..RECEIPT_MAX_POLLS {
            let receipt = self
                .driver
                .send_unwrapped("eth_getTransactionReceipt", vec![json!(hash)])
                .await?;

            if !receipt.is_null() {
                let status = receipt.get("status").and_then(Value::as_str).unwrap_or("0x1");
                if status == "0x0" {
                    return Ok(TxOutcome::Reverted(format!("transaction {:?} reverted", hash)));
                }
                return Ok(TxOutcome::Mined(hash));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }

        Err(ZeroError::RetriesExhausted {
            operation: format!("receipt for {:?}", hash),
            attempts: RECEIPT_MAX_POLLS,
        })
    }

    /// Read-only call against the latest block
    async fn call(&self, to: Address, data: Bytes) -> ZeroResult<Bytes> {
        let call = json!({ "to": to, "data": data });
        let raw = self
            .driver
            .send_unwrapped("eth_call", vec![call, json!("latest")])
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Transaction whose revert is an error
    async fn transact_checked(&self, operation: &str, to: Address, data: Bytes, overrides: &TxOverrides) -> ZeroResult<H256> {
        match self.transact(to, data, U256::zero(), overrides).await? {
            TxOutcome::Mined(hash) => {
                info!("{} mined: {:?}", operation, hash);
                Ok(hash)
            }
            TxOutcome::Reverted(reason) => Err(ZeroError::Rpc {
                code: 3,
                message: format!("{} reverted: {}", operation, reason),
            }),
        }
    }

    async fn fetch_genesis(&self) -> ZeroResult<u64> {
        let raw = self.call(self.address, calldata(GET_GENESIS, &[])).await?;

        match abi::decode(&[ParamType::Uint(256)], &raw)?.pop() {
            Some(Token::Uint(block)) => u64::try_from(block)
                .map_err(|_| ZeroError::Encoding(format!("getGenesis block {} out of range", block))),
            other => Err(ZeroError::Encoding(format!("getGenesis returned {:?}", other))),
        }
    }

    /// Let the pool pull any amount of `token` from our account
    pub async fn approve_pool(&self, token: Address, overrides: &TxOverrides) -> ZeroResult<H256> {
        let data = calldata(APPROVE, &[Token::Address(self.address), Token::Uint(U256::MAX)]);
        self.transact_checked("approve pool", token, data, overrides).await
    }

    /// Liquidity token the pool issues against deposits of `token`
    pub async fn liquidity_token_for(&self, token: Address) -> ZeroResult<Address> {
        let raw = self
            .call(self.address, calldata(GET_LIQUIDITY_TOKEN_HANDLER, &[Token::Address(token)]))
            .await?;

        match abi::decode(&[ParamType::Address], &raw)?.pop() {
            Some(Token::Address(handler)) if handler != Address::zero() => Ok(handler),
            Some(Token::Address(_)) => Err(ZeroError::InvalidRequest(format!(
                "no liquidity token for {:?}",
                token
            ))),
            other => Err(ZeroError::Encoding(format!("getLiquidityTokenHandler returned {:?}", other))),
        }
    }

    /// Let the liquidity token pull `token` from our account
    pub async fn approve_liquidity_token(&self, token: Address, overrides: &TxOverrides) -> ZeroResult<H256> {
        let liquidity_token = self.liquidity_token_for(token).await?;
        // 31 bytes of ones, one byte short of the maximum
        let allowance = U256::MAX >> 8;
        let data = calldata(APPROVE, &[Token::Address(liquidity_token), Token::Uint(allowance)]);
        self.transact_checked("approve liquidity token", token, data, overrides).await
    }

    /// Deposit `value` of `token` into the pool for liquidity tokens
    pub async fn add_liquidity(&self, token: Address, value: U256, overrides: &TxOverrides) -> ZeroResult<H256> {
        let liquidity_token = self.liquidity_token_for(token).await?;
        let data = calldata(ADD_LIQUIDITY, &[Token::Uint(value)]);
        self.transact_checked("add liquidity", liquidity_token, data, overrides).await
    }

    /// Burn `value` liquidity tokens for the underlying `token`
    pub async fn remove_liquidity(&self, token: Address, value: U256, overrides: &TxOverrides) -> ZeroResult<H256> {
        let liquidity_token = self.liquidity_token_for(token).await?;
        let data = calldata(REMOVE_LIQUIDITY, &[Token::Uint(value)]);
        self.transact_checked("remove liquidity", liquidity_token, data, overrides).await
    }

    /// Creation code the pool deploys borrow proxies with
    pub async fn borrow_proxy_creation_code(&self) -> ZeroResult<Bytes> {
        let raw = self
            .call(self.address, calldata(GET_BORROW_PROXY_CREATION_CODE, &[]))
            .await?;

        match abi::decode(&[ParamType::Bytes], &raw)?.pop() {
            Some(Token::Bytes(code)) if !code.is_empty() => Ok(code.into()),
            other => Err(ZeroError::Encoding(format!(
                "getBorrowProxyCreationCode returned {:?}",
                other
            ))),
        }
    }

    async fn logs(&self, address: Option<Address>, topics: Vec<Value>, from_block: u64) -> ZeroResult<Vec<Log>> {
        let mut filter = json!({
            "fromBlock": hex_block(from_block),
            "toBlock": "latest",
            "topics": topics,
        });
        if let Some(address) = address {
            filter["address"] = json!(address);
        }

        let logs = self.driver.send_unwrapped("eth_getLogs", vec![filter]).await?;
        Ok(serde_json::from_value(logs)?)
    }
}

fn decode_borrow_proxy_made(log: &Log) -> ZeroResult<BorrowProxyMade> {
    if log.topics.len() < 3 {
        return Err(ZeroError::Encoding("BorrowProxyMade log missing topics".into()));
    }
    let record = match abi::decode(&[ParamType::Bytes], &log.data)?.pop() {
        Some(Token::Bytes(b)) => b,
        other => return Err(ZeroError::Encoding(format!("BorrowProxyMade data: {:?}", other))),
    };

    Ok(BorrowProxyMade {
        user: Address::from(log.topics[1]),
        proxy_address: Address::from(log.topics[2]),
        record: record.into(),
        block_number: log.block_number.map(|b| b.as_u64()),
    })
}

/// ERC20 `Transfer` only; ERC721 transfers (value in a fourth topic) and malformed
/// data from arbitrary contracts yield `None`
fn decode_transfer(log: &Log) -> Option<TransferEvent> {
    if log.topics.len() != 3 || log.data.len() != 32 {
        debug!("Skipping non-ERC20 Transfer log from {:?}", log.address);
        return None;
    }
    let value = match abi::decode(&[ParamType::Uint(256)], &log.data).ok()?.pop() {
        Some(Token::Uint(value)) => value,
        _ => return None,
    };

    Some(TransferEvent {
        token: log.address,
        from: Address::from(log.topics[1]),
        to: Address::from(log.topics[2]),
        value,
        block_number: log.block_number.map(|b| b.as_u64()),
        transaction_hash: log.transaction_hash,
    })
}

#[async_trait]
impl SettlementContract for ShifterPool {
    async fn execute_borrow(
        &self,
        parcel: &LiquidityRequestParcel,
        bond: U256,
        timeout_expiry: U256,
        overrides: &TxOverrides,
    ) -> ZeroResult<H256> {
        let signature = parcel.signature().ok_or(ZeroError::SigningUnavailable)?;
        let request = &parcel.request;

        let data = calldata(
            EXECUTE_BORROW,
            &[
                Token::Tuple(vec![
                    request_token(request),
                    Token::Uint(request.gas_requested),
                    Token::Bytes(signature.to_vec()),
                ]),
                Token::Uint(bond),
                Token::Uint(timeout_expiry),
            ],
        );

        match self.transact(self.address, data, request.gas_requested, overrides).await? {
            TxOutcome::Mined(hash) => {
                info!("Borrow executed for proxy {:?}: {:?}", parcel.proxy_address(), hash);
                Ok(hash)
            }
            TxOutcome::Reverted(reason) => Err(ZeroError::Rpc {
                code: 3,
                message: format!("executeBorrow reverted: {}", reason),
            }),
        }
    }

    async fn repay_loan(&self, proxy: Address, trigger: &TriggerParcel, overrides: &TxOverrides) -> ZeroResult<H256> {
        let data = calldata(REPAY_LOAN, &[Token::Bytes(trigger.encode().to_vec())]);

        match self.transact(proxy, data, U256::zero(), overrides).await? {
            TxOutcome::Mined(hash) => {
                info!("Loan repaid through {:?}: {:?}", proxy, hash);
                Ok(hash)
            }
            TxOutcome::Reverted(reason) => {
                warn!("Repayment through {:?} rejected: {}", proxy, reason);
                Err(ZeroError::RepaymentRejected {
                    proxy: format!("{:?}", proxy),
                    reason,
                })
            }
        }
    }

    async fn default_loan(&self, proxy: Address, record: &Bytes, overrides: &TxOverrides) -> ZeroResult<H256> {
        let data = calldata(DEFAULT_LOAN, &[Token::Bytes(record.to_vec())]);

        match self.transact(proxy, data, U256::zero(), overrides).await? {
            TxOutcome::Mined(hash) => {
                info!("Loan defaulted through {:?}: {:?}", proxy, hash);
                Ok(hash)
            }
            TxOutcome::Reverted(reason) => Err(ZeroError::DefaultRejected {
                proxy: format!("{:?}", proxy),
                reason,
            }),
        }
    }

    async fn borrow_proxies(&self, borrower: Option<Address>, from_block: u64) -> ZeroResult<Vec<BorrowProxyMade>> {
        let topics = vec![
            json!(event_topic(BORROW_PROXY_MADE)),
            borrower.map(|b| json!(H256::from(b))).unwrap_or(Value::Null),
        ];

        let logs = self.logs(Some(self.address), topics, from_block).await?;
        logs.iter().map(decode_borrow_proxy_made).collect()
    }

    async fn genesis(&self) -> ZeroResult<u64> {
        let genesis = self.genesis.get_or_try_init(|| self.fetch_genesis()).await?;
        Ok(*genesis)
    }

    async fn latest_block(&self) -> ZeroResult<u64> {
        let raw = self.driver.send_unwrapped("eth_blockNumber", vec![]).await?;
        let block: U64 = serde_json::from_value(raw)?;
        Ok(block.as_u64())
    }

    async fn transfers(&self, proxy: Address, from_block: u64) -> ZeroResult<Vec<TransferEvent>> {
        let transfer = json!(event_topic(TRANSFER));
        let proxy_topic = json!(H256::from(proxy));

        let mut logs = self
            .logs(None, vec![transfer.clone(), proxy_topic.clone()], from_block)
            .await?;
        logs.extend(
            self.logs(None, vec![transfer, Value::Null, proxy_topic], from_block)
                .await?,
        );
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        Ok(logs.iter().filter_map(decode_transfer).collect())
    }
}
