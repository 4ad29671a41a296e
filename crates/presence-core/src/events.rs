//! Status feed for the UI layer.
//!
//! `StatusPublisher` fans `StatusEvent`s out to subscribers and remembers the
//! latest connection status and local identity so late subscribers can be
//! brought up to date.

use crate::peer_id::PeerIdentity;
use crate::peers::ConnectionStatus;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Identity reported before the orchestrator has started.
pub const INITIALIZING: &str = "Initializing...";

/// Externally observable status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusEvent {
    ConnectionStatus(ConnectionStatus),
    PeerFound { id: PeerIdentity, name: String },
    PeerDisconnected { id: PeerIdentity },
    /// Local identity, or `"Initializing..."` before start
    PeerIdUpdate { id: String },
}

/// Latest state, for on-demand queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connection_status: ConnectionStatus,
    pub peer_id: String,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::default(),
            peer_id: INITIALIZING.to_string(),
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    publisher: Weak<StatusPublisher>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.upgrade() {
            publisher.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(StatusEvent) + Send + Sync>;

/// Publishes status events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct StatusPublisher {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
    latest: RwLock<StatusSnapshot>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            latest: RwLock::new(StatusSnapshot::default()),
        }
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(StatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Arc::new(callback))
    }

    /// Subscribe and immediately receive the current status and identity.
    pub fn subscribe_with_replay(
        self: &Arc<Self>,
        callback: impl Fn(StatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Callback = Arc::new(callback);
        let subscription = self.register(Arc::clone(&callback));
        for event in self.current_events() {
            callback(event);
        }
        subscription
    }

    fn register(self: &Arc<Self>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, callback));
        Subscription {
            publisher: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Record the event's effect on the latest state and deliver it.
    pub fn publish(&self, event: StatusEvent) {
        {
            let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
            match &event {
                StatusEvent::ConnectionStatus(status) => latest.connection_status = *status,
                StatusEvent::PeerIdUpdate { id } => latest.peer_id = id.clone(),
                StatusEvent::PeerFound { .. } | StatusEvent::PeerDisconnected { .. } => {}
            }
        }
        self.emit(event);
    }

    /// Publish the local identity once it is known.
    pub fn set_local_identity(&self, id: &PeerIdentity) {
        self.publish(StatusEvent::PeerIdUpdate { id: id.to_string() });
    }

    /// Re-send current status and identity to every subscriber.
    ///
    /// Used when the UI signals it is ready and may have missed earlier events.
    pub fn replay(&self) {
        for event in self.current_events() {
            self.emit(event);
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_events(&self) -> [StatusEvent; 2] {
        let snapshot = self.snapshot();
        [
            StatusEvent::ConnectionStatus(snapshot.connection_status),
            StatusEvent::PeerIdUpdate {
                id: snapshot.peer_id,
            },
        ]
    }

    fn emit(&self, event: StatusEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
