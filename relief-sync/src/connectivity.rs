//! Connectivity tracking for field devices
//!
//! The platform (or a probe loop) reports online/offline transitions
//! here; the engine and any status UI subscribe through a watch channel.
//! Nothing is persisted: a fresh process starts offline until the first
//! report arrives, which keeps a restarting device from attempting the
//! network before anyone has actually observed it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Best-effort connectivity snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    /// Whether the device currently has a usable network path
    pub is_online: bool,
    /// Connection type hint, e.g. "wifi" or "cellular"
    pub connection_type: Option<String>,
    /// Connection quality hint, e.g. "4g" or "2g"
    pub effective_type: Option<String>,
}

impl ConnectivityStatus {
    pub fn online() -> Self {
        Self {
            is_online: true,
            connection_type: None,
            effective_type: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            connection_type: None,
            effective_type: None,
        }
    }
}

/// Tracks the device's connectivity state and fans out changes.
///
/// Subscribing hands out a watch receiver; dropping the receiver is the
/// unsubscribe. Reports that change nothing are not broadcast, so
/// subscribers only wake on real transitions or quality changes.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityStatus>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectivityStatus::offline());
        Self { tx }
    }

    /// Record a fresh connectivity observation
    pub fn report(&self, status: ConnectivityStatus) {
        let modified = self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.is_online != status.is_online {
                tracing::info!(online = status.is_online, "Connectivity changed");
            }
            *current = status.clone();
            true
        });
        if modified {
            tracing::debug!(
                online = status.is_online,
                connection_type = status.connection_type.as_deref(),
                effective_type = status.effective_type.as_deref(),
                "Connectivity status updated"
            );
        }
    }

    /// Convenience for hosts that only know the online/offline boolean
    pub fn set_online(&self, online: bool) {
        if online {
            self.report(ConnectivityStatus::online());
        } else {
            self.report(ConnectivityStatus::offline());
        }
    }

    /// Subscribe to connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.tx.subscribe()
    }

    /// Current snapshot
    pub fn status(&self) -> ConnectivityStatus {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().is_online
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
