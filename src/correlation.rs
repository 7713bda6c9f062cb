//! Matches inbound replies to the callers waiting for them.
//!
//! Every registered request id owns a oneshot slot. Exactly one of three
//! events completes it: a matching reply ([`PendingRequests::resolve`]), the
//! caller cancelling, or the connection dying ([`PendingRequests::fail_all`]).
//! Whoever removes the entry from the map owns the completion, so no slot is
//! ever completed twice.
//!
//! ```text
//! caller ── register(id) ──► map[id] = tx
//!        ── wait(slot) ────► rx.await  ◄── resolve(msg) ◄── receive loop
//!                                      ◄── fail_all()   ◄── teardown
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{DaemonError, Result};
use crate::protocol::Message;

/// Default capacity of the unsolicited side channel.
pub const DEFAULT_UNSOLICITED_CAPACITY: usize = 256;

type Completion = oneshot::Sender<Result<Message>>;

/// What [`PendingRequests::resolve`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to the waiting caller.
    Matched,
    /// No caller waiting; published on the unsolicited channel.
    Unsolicited,
}

struct State {
    waiting: HashMap<String, Completion>,
    closed: Option<String>,
}

struct Inner {
    state: Mutex<State>,
    unsolicited: broadcast::Sender<Message>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of in-flight requests for one connection.
///
/// Cheap to clone; all clones share the same map.
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    /// Create an empty registry with the default unsolicited capacity.
    pub fn new() -> Self {
        Self::with_unsolicited_capacity(DEFAULT_UNSOLICITED_CAPACITY)
    }

    /// Create an empty registry with a custom unsolicited capacity.
    pub fn with_unsolicited_capacity(capacity: usize) -> Self {
        let (unsolicited, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    waiting: HashMap::new(),
                    closed: None,
                }),
                unsolicited,
            }),
        }
    }

    /// Register `request_id` and return the slot its reply will land in.
    ///
    /// # Errors
    ///
    /// - `DuplicateRequest` if the id is already in flight; the existing entry
    ///   is left untouched.
    /// - `ConnectionLost` if the registry was already failed.
    pub fn register(&self, request_id: &str) -> Result<PendingSlot> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();

        if let Some(reason) = &state.closed {
            return Err(DaemonError::ConnectionLost(reason.clone()));
        }
        if state.waiting.contains_key(request_id) {
            tracing::error!(request_id, "request id collision");
            return Err(DaemonError::DuplicateRequest(request_id.to_string()));
        }
        state.waiting.insert(request_id.to_string(), tx);
        drop(state);

        tracing::trace!(request_id, "registered pending request");
        Ok(PendingSlot {
            request_id: request_id.to_string(),
            rx: Some(rx),
            registry: self.clone(),
        })
    }

    /// Wait for `slot` to resolve, or for `cancel` to fire.
    ///
    /// On cancellation the entry is removed and `Cancelled` returned. If a
    /// reply already claimed the entry, the reply wins and is returned instead.
    pub async fn wait(&self, mut slot: PendingSlot, cancel: &CancellationToken) -> Result<Message> {
        let Some(mut rx) = slot.rx.take() else {
            return Err(DaemonError::InvalidState {
                expected: "unresolved slot",
                actual: "consumed slot",
            });
        };

        tokio::select! {
            biased;

            outcome = &mut rx => {
                slot.settled();
                outcome.unwrap_or_else(|_| Err(DaemonError::ConnectionLost("request dropped".to_string())))
            }
            _ = cancel.cancelled() => {
                if self.cancel(&slot.request_id) {
                    tracing::debug!(request_id = %slot.request_id, "request cancelled by caller");
                    slot.settled();
                    return Err(DaemonError::Cancelled);
                }
                // Removed by a resolver already; its send is synchronous, so the
                // value is either in the channel or the sender was dropped.
                slot.settled();
                rx.await.unwrap_or_else(|_| Err(DaemonError::ConnectionLost("request dropped".to_string())))
            }
        }
    }

    /// Deliver an inbound message to its waiting caller.
    ///
    /// Messages nobody is waiting for go to the unsolicited channel.
    pub fn resolve(&self, message: Message) -> Resolution {
        let completion = self.inner.lock().waiting.remove(&message.request_id);

        match completion {
            Some(tx) => {
                tracing::trace!(request_id = %message.request_id, "reply matched");
                // The receiver may be gone if the caller's future was dropped.
                let _ = tx.send(Ok(message));
                Resolution::Matched
            }
            None => {
                tracing::debug!(
                    request_id = %message.request_id,
                    command = %message.command,
                    origin = %message.origin,
                    "unsolicited message"
                );
                if self.inner.unsolicited.send(message).is_err() {
                    tracing::debug!("no unsolicited subscribers, message dropped");
                }
                Resolution::Unsolicited
            }
        }
    }

    /// Fail every pending request with `ConnectionLost` and refuse new ones.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, Completion)> = {
            let mut state = self.inner.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.waiting.drain().collect()
        };

        let count = drained.len();
        for (request_id, tx) in drained {
            tracing::debug!(%request_id, reason, "failing pending request");
            let _ = tx.send(Err(DaemonError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            tracing::warn!(count, reason, "failed pending requests");
        }
        count
    }

    /// Remove an entry without completing it.
    ///
    /// Returns `false` if the entry was already resolved or never existed.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.inner.lock().waiting.remove(request_id).is_some()
    }

    /// Subscribe to messages that matched no pending request.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.unsolicited.subscribe()
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Check if no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-resolution slot of one registered request.
///
/// Dropping an unresolved slot removes its entry, so a caller whose future is
/// dropped mid-wait does not leak a map entry.
pub struct PendingSlot {
    request_id: String,
    rx: Option<oneshot::Receiver<Result<Message>>>,
    registry: PendingRequests,
}

impl PendingSlot {
    /// The request id this slot belongs to.
    #[inline]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn settled(&mut self) {
        self.rx = None;
        self.request_id.clear();
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if !self.request_id.is_empty() && self.registry.cancel(&self.request_id) {
            tracing::trace!(request_id = %self.request_id, "pending slot dropped unresolved");
        }
    }
}
