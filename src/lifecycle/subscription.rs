//! Cancellable event streams
//!
//! A [`Subscription`] owns a forwarding task. Dropping it cancels the task;
//! [`Subscription::unsubscribe`] additionally waits until the task has stopped.

use super::Zero;
use crate::lifecycle::RetryPolicy;
use crate::proxy::BorrowProxy;
use crate::request::{LiquidityRequestMessage, LiquidityRequestParcel};

use ethers::types::Address;
use futures::Stream;
use serde_json::Value;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Stream of items forwarded by a background task
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Parcels received over the signaling channel
pub type LiquidityRequestSubscription = Subscription<LiquidityRequestParcel>;

/// Borrow proxies created on chain
pub type BorrowSubscription = Subscription<BorrowProxy>;

impl<T: Send + 'static> Subscription<T> {
    fn spawn<F, Fut>(parent: &CancellationToken, task: F) -> Self
    where
        F: FnOnce(mpsc::Sender<T>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = parent.child_token();
        let handle = tokio::spawn(task(tx, cancel.clone()));

        Self {
            rx,
            cancel,
            handle: Some(handle),
        }
    }

    /// Next item, or `None` once unsubscribed
    pub async fn next_item(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stop forwarding and wait for the task to finish; safe to call repeatedly
    pub async fn unsubscribe(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Subscription task ended abnormally: {}", e);
            }
        }
        self.rx.close();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl<T> Unpin for Subscription<T> {}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forward channel messages addressed to our shifter pool as parcels
pub(crate) fn liquidity_requests(zero: &Zero, mut messages: broadcast::Receiver<Value>) -> LiquidityRequestSubscription {
    let params = zero.params().clone();

    Subscription::spawn(zero.shutdown_token(), move |tx, cancel| async move {
        info!("Listening for liquidity requests to {:?}", params.shifter_pool);

        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                received = messages.recv() => match received {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Liquidity request listener lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let message: LiquidityRequestMessage = match serde_json::from_value(raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Dropping malformed liquidity request: {}", e);
                    continue;
                }
            };

            if message.shifter_pool != params.shifter_pool {
                debug!("Ignoring liquidity request for pool {:?}", message.shifter_pool);
                continue;
            }

            match LiquidityRequestParcel::from_message(&message, &params) {
                Ok(parcel) => {
                    crate::metrics::record_parcel_received();
                    if tx.send(parcel).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Dropping liquidity request: {}", e),
            }
        }

        debug!("Liquidity request listener stopped");
    })
}

/// Poll for new `BorrowProxyMade` events, yielding each proxy once
pub(crate) fn borrows(
    zero: Arc<Zero>,
    borrower: Option<Address>,
    from_block: u64,
    policy: RetryPolicy,
) -> BorrowSubscription {
    let parent = zero.shutdown_token().clone();

    Subscription::spawn(&parent, move |tx, cancel| async move {
        let settlement = zero.settlement();
        let mut next_block = from_block;
        let mut seen: HashSet<Address> = HashSet::new();

        loop {
            match settlement.latest_block().await {
                Ok(latest) if latest >= next_block => {
                    match settlement.borrow_proxies(borrower, next_block).await {
                        Ok(events) => {
                            for event in events {
                                if !seen.insert(event.proxy_address) {
                                    continue;
                                }
                                match BorrowProxy::from_event(zero.clone(), &event) {
                                    Ok(proxy) => {
                                        if tx.send(proxy).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => warn!("Undecodable borrow proxy {:?}: {}", event.proxy_address, e),
                                }
                            }
                            next_block = latest + 1;
                        }
                        // Don't advance, will retry
                        Err(e) => warn!("Failed to fetch borrow proxy events: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to get block number: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    })
}
