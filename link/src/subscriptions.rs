//! Subscription registry and live results.
//!
//! A subscription is an open-ended stream: the gateway keeps sending
//! updates until the client unsubscribes or the session dies. Each entry
//! owns a [`LiveResult`] that is mutated in place by the dispatch path and
//! a bounded push channel feeding the consumer handle. The originating
//! parameters are stored verbatim so the owning layer can resubscribe
//! after a reconnect.
//!
//! Two subscriptions with identical parameters are independent: each gets
//! its own id, live result, and push channel.

use crate::models::{SubscribeParams, SubscriptionId, SubscriptionInfo, UpdateEvent, UpdateKind};
use log::{debug, warn};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of each subscription's push channel. When full, further
/// pushes are dropped with a warning; the pull-side snapshot stays exact.
pub(crate) const UPDATE_CHANNEL_CAPACITY: usize = 8192;

/// Point-in-time copy of a live result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSnapshot {
    /// Rows accumulated by `Append` updates, cleared by `Clear`.
    pub rows: Vec<JsonValue>,
    /// State object installed wholesale by `Replace` updates.
    pub state: JsonValue,
    /// Bumped once per applied update.
    pub revision: u64,
    /// Set when the owning session was torn down.
    pub stale: bool,
}

/// The continuously updated result container of one subscription.
///
/// The dispatch path writes, any number of readers snapshot concurrently.
/// Every update is applied under one write lock, so a reader observes
/// either the pre-update or the post-update state, never a mix.
#[derive(Debug, Default)]
pub struct LiveResult {
    inner: RwLock<LiveSnapshot>,
}

impl LiveResult {
    /// Copy the current state.
    pub fn snapshot(&self) -> LiveSnapshot {
        self.read().clone()
    }

    /// Rows accumulated so far.
    pub fn rows(&self) -> Vec<JsonValue> {
        self.read().rows.clone()
    }

    /// Current state object (`Null` until the first `Replace`).
    pub fn state(&self) -> JsonValue {
        self.read().state.clone()
    }

    /// Number of updates applied so far.
    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    /// Whether the owning session has been torn down.
    pub fn is_stale(&self) -> bool {
        self.read().stale
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LiveSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LiveSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn apply(&self, kind: UpdateKind, data: &JsonValue) {
        let mut state = self.write();
        match kind {
            UpdateKind::Append => state.rows.push(data.clone()),
            UpdateKind::Replace => state.state = data.clone(),
            UpdateKind::Clear => state.rows.clear(),
        }
        state.revision += 1;
    }

    pub(crate) fn set_stale(&self, stale: bool) {
        self.write().stale = stale;
    }
}

struct SubscriptionEntry {
    params: SubscribeParams,
    live: Arc<LiveResult>,
    /// Dropped when the entry goes stale, ending the consumer's stream.
    update_tx: Option<mpsc::Sender<UpdateEvent>>,
    updates_received: u64,
}

struct Inner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
}

/// Registry of live subscriptions for one session epoch.
///
/// Cloning is cheap; clones share the same table, which lets the dispatch
/// task and the caller-facing API operate on it concurrently. Every
/// mutation is a single locked step.
#[derive(Clone)]
pub struct Subscriptions {
    inner: Arc<Inner>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscription. Identical params never share an entry.
    ///
    /// Returns the id, the shared live result, and the push-channel
    /// receiver for the consumer handle.
    pub(crate) fn insert(
        &self,
        params: SubscribeParams,
    ) -> (SubscriptionId, Arc<LiveResult>, mpsc::Receiver<UpdateEvent>) {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let live = Arc::new(LiveResult::default());
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        self.lock().insert(
            id,
            SubscriptionEntry {
                params,
                live: live.clone(),
                update_tx: Some(update_tx),
                updates_received: 0,
            },
        );
        (id, live, update_rx)
    }

    /// Apply an update to the live result and push it to the consumer.
    /// Returns `false` for unknown (cancelled or stale-epoch) ids.
    pub fn update(&self, id: SubscriptionId, kind: UpdateKind, data: JsonValue) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.live.apply(kind, &data);
                entry.updates_received += 1;
                if let Some(tx) = &entry.update_tx {
                    match tx.try_send(UpdateEvent {
                        subscription_id: id,
                        kind,
                        data,
                    }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(
                                "[trade-link] Push channel full for subscription {}, dropping update",
                                id
                            );
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(
                                "[trade-link] Consumer gone for subscription {}, update not pushed",
                                id
                            );
                        }
                    }
                }
                true
            }
            None => {
                debug!("[trade-link] Update for unknown subscription {}", id);
                false
            }
        }
    }

    /// Remove a subscription. Further updates for its id are discarded;
    /// readers still holding its [`LiveResult`] see no further mutation.
    pub fn remove(&self, id: SubscriptionId) -> Option<SubscribeParams> {
        self.lock().remove(&id).map(|entry| entry.params)
    }

    /// Parameters the subscription was created with.
    pub fn params(&self, id: SubscriptionId) -> Option<SubscribeParams> {
        self.lock().get(&id).map(|entry| entry.params.clone())
    }

    /// Snapshot of every registered subscription.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                id: *id,
                params: entry.params.clone(),
                stale: entry.live.is_stale(),
                updates_received: entry.updates_received,
            })
            .collect()
    }

    /// Mark every live result stale and end the push streams. Entries are
    /// kept so the owning layer can read back the stored params and
    /// resubscribe after reconnect.
    pub fn mark_all_stale(&self) {
        for entry in self.lock().values_mut() {
            entry.live.set_stale(true);
            entry.update_tx = None;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}
