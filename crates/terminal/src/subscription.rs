//! Per-session event fan-out.
//!
//! Subscribers register interest in a session id, not in a session object:
//! they may subscribe before the session exists, and stay registered across
//! process exit and re-spawn. Each registration has its own id so removing
//! one never disturbs another.
//!
//! Delivery goes through unbounded channels. A slow consumer grows its own
//! queue; it never blocks the PTY reader or other subscribers.

use collections::FxHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Event pushed to subscribers of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TerminalEvent {
    /// Output with shell-integration markers removed.
    Data { data: String },
    /// The process ended. The subscription stays open.
    #[serde(rename_all = "camelCase")]
    Exit {
        exit_code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

/// Identity of a single registration.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<TerminalEvent>,
}

/// Session id to subscriber list.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<FxHashMap<String, Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new listener for `session_id`.
    pub fn subscribe(self: &Arc<Self>, session_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, sender });

        tracing::debug!(session_id, subscriber = id, "Subscribed");
        Subscription {
            receiver,
            guard: SubscriptionGuard {
                registry: Arc::downgrade(self),
                session_id: session_id.to_string(),
                id,
            },
        }
    }

    /// Remove exactly one listener. Returns false if it was already gone.
    pub fn unsubscribe(&self, session_id: &str, subscriber: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(session_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != subscriber);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(session_id);
        }
        if removed {
            tracing::debug!(session_id, subscriber, "Unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every listener of `session_id`.
    ///
    /// Listeners whose receiving side is gone are pruned; the rest still get
    /// the event. Returns the number of successful deliveries.
    pub fn broadcast(&self, session_id: &str, event: &TerminalEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(session_id) else {
            return 0;
        };

        list.retain(|entry| match entry.sender.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    session_id,
                    subscriber = entry.id,
                    "Pruning subscriber with closed receiver"
                );
                false
            }
        });

        let delivered = list.len();
        if list.is_empty() {
            subscribers.remove(session_id);
        }
        delivered
    }

    /// Number of listeners currently registered for `session_id`.
    pub fn listener_count(&self, session_id: &str) -> usize {
        self.subscribers
            .lock()
            .get(session_id)
            .map_or(0, |list| list.len())
    }
}

/// Removes its registration when dropped.
pub struct SubscriptionGuard {
    registry: Weak<SubscriberRegistry>,
    session_id: String,
    id: SubscriberId,
}

impl SubscriptionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the registration now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.session_id, self.id);
        }
    }
}

/// A live registration plus its event queue.
pub struct Subscription {
    receiver: UnboundedReceiver<TerminalEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        self.guard.session_id()
    }

    pub fn id(&self) -> SubscriberId {
        self.guard.id()
    }

    /// Wait for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<TerminalEvent> {
        self.receiver.recv().await
    }

    /// Next queued event, if any.
    pub fn try_recv(&mut self) -> Option<TerminalEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive for use outside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<TerminalEvent> {
        self.receiver.blocking_recv()
    }

    /// Drain everything queued right now.
    pub fn drain(&mut self) -> Vec<TerminalEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Remove the registration. Already-queued events are discarded.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Split into the registration guard and the receiving end, so a
    /// transport can forward events on a task while unsubscribing
    /// synchronously through the guard.
    pub fn into_parts(self) -> (SubscriptionGuard, UnboundedReceiver<TerminalEvent>) {
        (self.guard, self.receiver)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.guard.session_id)
            .field("id", &self.guard.id)
            .finish()
    }
}
