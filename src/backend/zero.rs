//! Signaling backend: liquidity request broadcast and borrow proxy selection

use super::Backend;
use crate::error::{ZeroError, ZeroResult};
use crate::pubsub::{PubSub, LIQUIDITY_REQUEST_TOPIC};
use crate::rpc::RpcRequest;

use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

const NAME: &str = "zero";

/// Borrow proxy that intercepted settlement calls are routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveProxy {
    pub address: Address,
    pub borrower: Address,
}

/// Shared cell holding the active proxy selection
pub type ProxySelection = Arc<RwLock<Option<ActiveProxy>>>;

/// Signaling and coordination adapter
pub struct ZeroBackend {
    channel: Arc<dyn PubSub>,
    active: ProxySelection,
}

impl ZeroBackend {
    pub fn new(channel: Arc<dyn PubSub>) -> Self {
        Self {
            channel,
            active: Arc::new(RwLock::new(None)),
        }
    }

    /// Handle to the active proxy selection, shared with interceptors
    pub fn selection(&self) -> ProxySelection {
        self.active.clone()
    }

    pub fn channel(&self) -> Arc<dyn PubSub> {
        self.channel.clone()
    }

    /// Raw liquidity request messages as they arrive on the channel
    pub fn subscribe_liquidity_requests(&self) -> broadcast::Receiver<Value> {
        self.channel.subscribe(LIQUIDITY_REQUEST_TOPIC)
    }

    async fn set_borrow_proxy(&self, request: &RpcRequest) -> ZeroResult<Value> {
        let param = request
            .first_param()
            .cloned()
            .ok_or_else(|| ZeroError::InvalidRequest("0cf_setBorrowProxy without proxy".into()))?;
        let proxy: ActiveProxy = serde_json::from_value(param)?;

        info!("Active borrow proxy set to {:?}", proxy.address);
        *self.active.write().await = Some(proxy);
        Ok(json!(true))
    }
}

#[async_trait]
impl Backend for ZeroBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prefixes(&self) -> &'static [&'static str] {
        &["0cf"]
    }

    async fn send(&self, request: &RpcRequest) -> ZeroResult<Value> {
        match request.method.as_str() {
            "0cf_broadcastLiquidityRequest" => {
                let message = request.first_param().cloned().ok_or_else(|| {
                    ZeroError::InvalidRequest("broadcast without message".into())
                })?;
                self.channel.publish(LIQUIDITY_REQUEST_TOPIC, message).await?;
                Ok(json!(true))
            }
            "0cf_setBorrowProxy" => self.set_borrow_proxy(request).await,
            "0cf_clearBorrowProxy" => {
                *self.active.write().await = None;
                Ok(json!(true))
            }
            "0cf_getBorrowProxy" => {
                let active = *self.active.read().await;
                Ok(json!(active.map(|p| p.address)))
            }
            "0cf_getActiveBorrowProxy" => {
                let active = *self.active.read().await;
                Ok(serde_json::to_value(active)?)
            }
            other => Err(ZeroError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}
