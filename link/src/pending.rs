//! Pending-call registry: correlates outbound requests with their replies.
//!
//! Every request issued on a session registers here and receives a
//! [`CallHandle`] to wait on. The dispatch path resolves or fails entries
//! as replies arrive; session teardown flushes everything that is still
//! pending so no caller blocks past the life of the connection.
//!
//! Resolution is at-most-once per call id. `resolve`/`fail`/`cancel` on an
//! id that is unknown (already resolved, cancelled, or from a prior
//! session) are no-ops, which is what makes a reply arriving after the
//! caller's timeout harmless.

use crate::error::{Result, TradeLinkError};
use crate::models::CallId;
use crate::timeouts::TradeLinkTimeouts;
use log::debug;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

struct PendingCall {
    tx: oneshot::Sender<Result<JsonValue>>,
    /// Context from the originating request, kept so the dispatch path
    /// can shape the reply (e.g. the entity the request concerned).
    context: Option<JsonValue>,
}

struct Inner {
    next_id: AtomicU64,
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

/// Registry of in-flight calls for one session epoch.
///
/// Cloning is cheap; clones share the same table, which lets the dispatch
/// task and the caller-facing API operate on it concurrently. Every
/// mutation is a single locked step.
#[derive(Clone)]
pub struct PendingCalls {
    inner: Arc<Inner>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh call id and register its result slot.
    ///
    /// The returned [`CallHandle`] is the only way to receive the result.
    pub fn register(&self, context: Option<JsonValue>) -> (CallId, CallHandle) {
        let id = CallId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, PendingCall { tx, context });
        (
            id,
            CallHandle {
                id,
                rx,
                registry: self.clone(),
            },
        )
    }

    /// Complete a call with a value. Returns `false` for unknown ids.
    pub fn resolve(&self, id: CallId, value: JsonValue) -> bool {
        match self.lock().remove(&id) {
            Some(call) => {
                // The receiver may already be gone (caller timed out);
                // the send result is intentionally ignored.
                let _ = call.tx.send(Ok(value));
                true
            }
            None => {
                debug!("[trade-link] Discarding reply for unknown call {}", id);
                false
            }
        }
    }

    /// Complete a call with an error. Returns `false` for unknown ids.
    pub fn fail(&self, id: CallId, error: TradeLinkError) -> bool {
        match self.lock().remove(&id) {
            Some(call) => {
                let _ = call.tx.send(Err(error));
                true
            }
            None => {
                debug!("[trade-link] Discarding error for unknown call {}", id);
                false
            }
        }
    }

    /// Drop a registration without completing it. Returns `false` for
    /// unknown ids. A reply that arrives later is discarded.
    pub fn cancel(&self, id: CallId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Context stored with the originating request, if any.
    pub fn context(&self, id: CallId) -> Option<JsonValue> {
        self.lock().get(&id).and_then(|call| call.context.clone())
    }

    /// Fail every still-pending call. Used on session teardown so no
    /// caller blocks forever.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(CallId, PendingCall)> = self.lock().drain().collect();
        if !drained.is_empty() {
            debug!(
                "[trade-link] Failing {} pending call(s): {}",
                drained.len(),
                reason
            );
        }
        for (_, call) in drained {
            let _ = call
                .tx
                .send(Err(TradeLinkError::ConnectionLost(reason.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-held handle for one in-flight call.
pub struct CallHandle {
    id: CallId,
    rx: oneshot::Receiver<Result<JsonValue>>,
    registry: PendingCalls,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the call to resolve, bounded by `timeout`.
    ///
    /// On expiry the handle cancels its own registry entry and returns
    /// [`TradeLinkError::TimeoutError`]; a reply arriving afterwards is
    /// discarded by the registry without disturbing this outcome.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<JsonValue> {
        let CallHandle { id, rx, registry } = self;
        let bounded = matches!(timeout, Some(t) if !TradeLinkTimeouts::is_no_timeout(t));
        if bounded {
            let deadline = timeout.unwrap_or_default();
            match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TradeLinkError::ConnectionLost(
                    "result slot dropped before resolution".to_string(),
                )),
                Err(_) => {
                    registry.cancel(id);
                    Err(TradeLinkError::TimeoutError(format!(
                        "no reply for call {} within {:?}",
                        id, deadline
                    )))
                }
            }
        } else {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(TradeLinkError::ConnectionLost(
                    "result slot dropped before resolution".to_string(),
                )),
            }
        }
    }
}
