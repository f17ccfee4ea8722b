//! Method interception on the settlement chain backend
//!
//! While a borrow proxy is active, user transactions are rewritten into
//! `proxy(to, value, data)` calls on the proxy contract so that the loan's funds,
//! not the user's own account, back them.

use crate::backend::zero::ProxySelection;
use crate::backend::{ActiveProxy, Backend};
use crate::error::{ZeroError, ZeroResult};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Rewrites calls before (or instead of) handing them to the wrapped backend
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, inner: &dyn Backend, request: &RpcRequest) -> ZeroResult<Value>;
}

/// A backend whose calls pass through an interceptor
pub struct InterceptedBackend {
    inner: Arc<dyn Backend>,
    interceptor: Arc<dyn Interceptor>,
}

impl InterceptedBackend {
    pub fn new(inner: Arc<dyn Backend>, interceptor: Arc<dyn Interceptor>) -> Self {
        Self { inner, interceptor }
    }
}

#[async_trait]
impl Backend for InterceptedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn prefixes(&self) -> &'static [&'static str] {
        self.inner.prefixes()
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        self.interceptor.intercept(self.inner.as_ref(), request).await
    }
}

/// Encode the proxy contract's `proxy(address,uint256,bytes)` call
pub fn encode_proxy_call(to: Address, value: U256, data: &[u8]) -> Bytes {
    let mut encoded = id("proxy(address,uint256,bytes)").to_vec();
    encoded.extend(abi::encode(&[
        Token::Address(to),
        Token::Uint(value),
        Token::Bytes(data.to_vec()),
    ]));
    encoded.into()
}

/// Routes settlement chain activity through the active borrow proxy
pub struct BorrowProxyInterceptor {
    selection: ProxySelection,
}

impl BorrowProxyInterceptor {
    pub fn new(selection: ProxySelection) -> Self {
        Self { selection }
    }

    async fn active(&self) -> ZeroResult<ActiveProxy> {
        let active = *self.selection.read().await;
        active.ok_or_else(|| ZeroError::UnsupportedOperation("no borrow proxy selected".into()))
    }

    /// First account of the wrapped backend, used as the outer sender
    async fn own_account(inner: &dyn Backend) -> ZeroResult<Address> {
        let accounts = inner.send(&RpcRequest::new("eth_accounts", vec![])).await?;
        let accounts: Vec<Address> = serde_json::from_value(accounts)?;
        accounts.first().copied().ok_or(ZeroError::SigningUnavailable)
    }

    async fn rewrite_transaction(&self, inner: &dyn Backend, request: &RpcRequest) -> ZeroResult<Value> {
        let proxy = self.active().await?;
        let mut tx = tx_object(request)?;

        let to: Address = match tx.get("to") {
            Some(to) if !to.is_null() => serde_json::from_value(to.clone())?,
            _ => {
                return Err(ZeroError::UnsupportedOperation(
                    "contract creation through a borrow proxy".into(),
                ))
            }
        };
        let value: U256 = match tx.get("value") {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => U256::zero(),
        };
        let data: Bytes = match tx.get("data").or_else(|| tx.get("input")) {
            Some(d) if !d.is_null() => serde_json::from_value(d.clone())?,
            _ => Bytes::new(),
        };

        let from = Self::own_account(inner).await?;

        // gas, gasLimit, gasPrice, nonce and value are carried over untouched
        tx.remove("input");
        tx.insert("from".into(), json!(from));
        tx.insert("to".into(), json!(proxy.address));
        tx.insert("data".into(), json!(encode_proxy_call(to, value, &data)));

        debug!(
            "Routing {} to {:?} through borrow proxy {:?}",
            request.method, to, proxy.address
        );

        let mut params = request.params.clone();
        params[0] = Value::Object(tx);
        inner.send(&request.with_params(params)).await
    }

    async fn rewrite_call(&self, inner: &dyn Backend, request: &RpcRequest) -> ZeroResult<Value> {
        let proxy = self.active().await?;
        let mut call = tx_object(request)?;
        call.insert("from".into(), json!(proxy.address));

        let mut params = request.params.clone();
        params[0] = Value::Object(call);
        inner.send(&request.with_params(params)).await
    }
}

fn tx_object(request: &RpcRequest) -> ZeroResult<Map<String, Value>> {
    match request.first_param() {
        Some(Value::Object(map)) => Ok(map.clone()),
        _ => Err(ZeroError::InvalidRequest(format!(
            "{} expects a transaction object",
            request.method
        ))),
    }
}

#[async_trait]
impl Interceptor for BorrowProxyInterceptor {
    async fn intercept(&self, inner: &dyn Backend, request: &RpcRequest) -> ZeroResult<Value> {
        match request.method.as_str() {
            "eth_accounts" | "eth_requestAccounts" => Ok(json!([self.active().await?.borrower])),
            "eth_sendTransaction" | "eth_estimateGas" => self.rewrite_transaction(inner, request).await,
            "eth_call" => self.rewrite_call(inner, request).await,
            "eth_sign" | "personal_sign" => Err(ZeroError::UnsupportedOperation(
                "borrow proxy cannot sign messages".into(),
            )),
            m if m.starts_with("eth_signTypedData") => Err(ZeroError::UnsupportedOperation(
                "borrow proxy cannot sign typed data".into(),
            )),
            _ => inner.send(request).await,
        }
    }
}
