//! Publish/subscribe channel used to signal liquidity requests between parties
//!
//! [`LocalChannel`] is an in-process bus: every party sharing one instance sees every
//! message. [`RelayChannel`] additionally forwards publications to a remote keeper's
//! JSON-RPC ingest endpoint.

use crate::backend::{http_provider, map_provider_error};
use crate::error::ZeroResult;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::providers::{Http, Provider};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Topic carrying signed liquidity request parcels
pub const LIQUIDITY_REQUEST_TOPIC: &str = "zero.liquidity-requests";

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcast/subscribe channel shared by borrowers and keepers
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message; delivery is best effort and may duplicate
    async fn publish(&self, topic: &str, message: Value) -> ZeroResult<()>;

    /// Subscribe to every message published on `topic` from now on
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-process bus backed by one broadcast channel per topic
#[derive(Default)]
pub struct LocalChannel {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSub for LocalChannel {
    async fn publish(&self, topic: &str, message: Value) -> ZeroResult<()> {
        if self.sender(topic).send(message).is_err() {
            // No receivers, that's okay
            debug!("Published to {} with no subscribers", topic);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).subscribe()
    }
}

/// Local bus that also relays publications to a remote keeper
pub struct RelayChannel {
    local: LocalChannel,
    remote: Provider<Http>,
}

impl RelayChannel {
    pub fn new(relay_url: &str) -> ZeroResult<Self> {
        Ok(Self {
            local: LocalChannel::new(),
            remote: http_provider("relay", relay_url)?,
        })
    }
}

#[async_trait]
impl PubSub for RelayChannel {
    async fn publish(&self, topic: &str, message: Value) -> ZeroResult<()> {
        if topic == LIQUIDITY_REQUEST_TOPIC {
            self.remote
                .request::<_, Value>("0cf_broadcastLiquidityRequest", vec![message.clone()])
                .await
                .map_err(|e| {
                    warn!("Relay publish failed: {}", e);
                    map_provider_error("relay", e)
                })?;
        }
        self.local.publish(topic, message).await
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.local.subscribe(topic)
    }
}
