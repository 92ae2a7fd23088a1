//! In-process event bus for sync lifecycle notifications
//!
//! Status badges and host UIs subscribe here instead of polling the
//! queue. Events are fire-and-forget: a slow subscriber lags, it never
//! blocks the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events published by the sync engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A sync cycle started with this many items in the batch
    SyncStarted { batch_size: usize },
    /// A sync cycle finished
    SyncCompleted {
        synced: usize,
        conflicts: usize,
        failed: usize,
    },
    /// A change was accepted by the server
    ItemSynced {
        change_id: Uuid,
        entity_uuid: Uuid,
        server_id: String,
    },
    /// A conflict was resolved by taking the server copy
    ConflictResolved { change_id: Uuid, entity_uuid: Uuid },
    /// A failed change was rescheduled
    RetryScheduled {
        change_id: Uuid,
        attempts: i32,
        next_retry: DateTime<Utc>,
    },
    /// A change exhausted its retries and moved to the failed queue
    ItemDeadLettered { change_id: Uuid, entity_uuid: Uuid },
    /// The device went online or offline
    ConnectivityChanged { online: bool },
}

/// Broadcast bus for [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
