//! Engine events for presentation surfaces.
//!
//! Provides `EngineEvent` describing state changes and `EventBus` for
//! subscriptions. Subscribers are read-only renderers; nothing in the engine
//! depends on who is listening.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// State changes emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// The agent channel came up.
    AgentConnected,
    /// The agent channel went down.
    AgentDisconnected {
        /// Pending operations failed by the disconnect.
        failed: usize,
    },
    /// Queue contents or timer state changed.
    #[serde(rename_all = "camelCase")]
    QueueChanged {
        pending: Vec<String>,
        paused: bool,
        /// Time left before an automatic flush.
        remaining_ms: Option<u64>,
    },
    /// A save for one record went out to the agent.
    #[serde(rename_all = "camelCase")]
    SaveDispatched {
        table: String,
        record_id: String,
        fields: Vec<String>,
    },
    /// The agent confirmed a save.
    #[serde(rename_all = "camelCase")]
    SaveAcknowledged {
        table: Option<String>,
        record_id: Option<String>,
    },
    /// A new remote record was created for a local file.
    #[serde(rename_all = "camelCase")]
    RecordCreated {
        path: String,
        record_id: String,
        name: String,
    },
    /// Remote content was written to disk.
    RecordWritten { path: String },
    /// A remote write was abandoned.
    #[serde(rename_all = "camelCase")]
    WriteDropped {
        table: String,
        record_id: String,
        reason: String,
    },
    /// A rename was rejected and reverted.
    #[serde(rename_all = "camelCase")]
    RenameReverted {
        old_path: String,
        new_path: String,
        reason: String,
    },
    /// A user-facing error.
    ErrorSurfaced { message: String },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Event bus for publishing engine events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        f.debug_struct("EventBus")
            .field("subscribers", &subscribers)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: EngineEvent) {
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}
