//! Request router over the registered chain backends
//!
//! The registry is fixed at construction. Only the per-backend interception slot can
//! change afterwards, and every call snapshots that slot exactly once, so an install
//! or uninstall never tears an in-flight call.

pub mod intercept;

pub use intercept::{BorrowProxyInterceptor, InterceptedBackend, Interceptor};

use crate::backend::Backend;
use crate::error::{ZeroError, ZeroResult};
use crate::rpc::{RpcRequest, RpcResponse};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One registered backend with its interception slot
struct BackendSlot {
    name: &'static str,
    /// Normalized prefixes, each ending in `_`
    prefixes: Vec<String>,
    /// Implementation captured at registration
    pristine: Arc<dyn Backend>,
    /// Implementation calls are dispatched to
    active: RwLock<Arc<dyn Backend>>,
}

impl BackendSlot {
    fn new(backend: Arc<dyn Backend>) -> Self {
        let prefixes = backend
            .prefixes()
            .iter()
            .map(|p| normalize_prefix(p))
            .collect();

        Self {
            name: backend.name(),
            prefixes,
            active: RwLock::new(backend.clone()),
            pristine: backend,
        }
    }

    fn claims(&self, method: &str) -> bool {
        self.prefixes.iter().any(|p| method.starts_with(p.as_str()))
    }

    async fn snapshot(&self) -> Arc<dyn Backend> {
        self.active.read().await.clone()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{}_", prefix)
    }
}

/// Multi-backend router
pub struct Driver {
    slots: Vec<BackendSlot>,
}

impl Driver {
    /// Register backends, rejecting any overlapping prefix claims
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> ZeroResult<Self> {
        let mut slots: Vec<BackendSlot> = Vec::with_capacity(backends.len());

        for backend in backends {
            let incoming = BackendSlot::new(backend);

            for slot in &slots {
                for existing in &slot.prefixes {
                    for prefix in &incoming.prefixes {
                        if existing.starts_with(prefix.as_str()) || prefix.starts_with(existing.as_str()) {
                            return Err(ZeroError::DuplicatePrefix {
                                prefix: prefix.clone(),
                                existing: slot.name.to_string(),
                                incoming: incoming.name.to_string(),
                            });
                        }
                    }
                }
            }

            debug!("Registered backend {} for {:?}", incoming.name, incoming.prefixes);
            slots.push(incoming);
        }

        info!("Driver initialized with {} backends", slots.len());
        Ok(Self { slots })
    }

    fn route(&self, method: &str) -> ZeroResult<&BackendSlot> {
        self.slots
            .iter()
            .find(|slot| slot.claims(method))
            .ok_or_else(|| ZeroError::UnknownMethod {
                method: method.to_string(),
            })
    }

    fn slot(&self, name: &str) -> ZeroResult<&BackendSlot> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .ok_or_else(|| ZeroError::Config(format!("No backend named {}", name)))
    }

    /// Dispatch a full request and wrap the outcome in a response envelope
    pub async fn send(&self, request: RpcRequest) -> RpcResponse {
        match self.dispatch(&request, true).await {
            Ok(result) => RpcResponse::result(request.id, result),
            Err(e) => {
                debug!("{} failed: {}", request.method, e);
                RpcResponse::error(request.id, &e)
            }
        }
    }

    /// Call through any installed interception
    pub async fn send_wrapped(&self, method: &str, params: Vec<Value>) -> ZeroResult<Value> {
        self.dispatch(&RpcRequest::new(method, params), true).await
    }

    /// Call the backend as registered, bypassing interception
    pub async fn send_unwrapped(&self, method: &str, params: Vec<Value>) -> ZeroResult<Value> {
        self.dispatch(&RpcRequest::new(method, params), false).await
    }

    async fn dispatch(&self, request: &RpcRequest, wrapped: bool) -> ZeroResult<Value> {
        let slot = self.route(&request.method)?;
        let backend = if wrapped {
            slot.snapshot().await
        } else {
            slot.pristine.clone()
        };

        let result = backend.send(request).await;
        if let Err(ref e) = result {
            if e.is_retryable() {
                crate::metrics::record_backend_error(slot.name);
            }
        }
        result
    }

    /// Wrap a backend's pristine implementation with an interceptor
    ///
    /// Installing again replaces the previous interceptor rather than stacking on it.
    pub async fn install_interceptor(
        &self,
        backend: &str,
        interceptor: Arc<dyn Interceptor>,
    ) -> ZeroResult<()> {
        let slot = self.slot(backend)?;
        let wrapped: Arc<dyn Backend> =
            Arc::new(InterceptedBackend::new(slot.pristine.clone(), interceptor));

        *slot.active.write().await = wrapped;
        info!("Interception installed on {}", backend);
        Ok(())
    }

    /// Restore the registered implementation
    pub async fn uninstall_interceptor(&self, backend: &str) -> ZeroResult<()> {
        let slot = self.slot(backend)?;
        let mut active = slot.active.write().await;

        if Arc::ptr_eq(&*active, &slot.pristine) {
            warn!("No interception installed on {}", backend);
        }
        *active = slot.pristine.clone();
        info!("Interception removed from {}", backend);
        Ok(())
    }

    /// Whether the backend currently dispatches through an interceptor
    pub async fn is_intercepted(&self, backend: &str) -> ZeroResult<bool> {
        let slot = self.slot(backend)?;
        let active = slot.snapshot().await;
        Ok(!Arc::ptr_eq(&active, &slot.pristine))
    }

    /// Implementation captured at registration, never intercepted
    pub fn get_backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.pristine.clone())
    }

    /// Implementation calls to a backend currently dispatch to
    pub async fn active_backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        match self.slots.iter().find(|slot| slot.name == name) {
            Some(slot) => Some(slot.snapshot().await),
            None => None,
        }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.name).collect()
    }
}
