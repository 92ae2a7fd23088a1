//! Offline-first synchronization engine for ReliefLine field devices
//!
//! Relief crews work where the network does not: collapsed cell
//! coverage, saturated satellite links, convoys moving in and out of
//! range. This crate lets the field application keep writing as if it
//! were online and reconciles with the server of record whenever a
//! window of connectivity opens.
//!
//! Features:
//! - Durable SQLite queue of outbound changes, encrypted at rest
//! - Priority-ordered batch submission with a hard per-batch cap
//! - Exponential backoff per change and a dead-letter queue after the
//!   retry budget is spent
//! - Last-write-wins conflict resolution that keeps a tamper-evident
//!   record of every overwritten local edit
//! - Immediate queue drain when connectivity returns, plus a periodic
//!   sweep as a safety net
//!
//! # Example
//!
//! ```no_run
//! use relief_sync::{
//!     ConnectivityMonitor, HttpReconcileClient, LocalStore, LocalStoreConfig,
//!     SyncConfig, SyncEngine,
//! };
//! use crypto::NoOpEncryptor;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(
//!     LocalStore::new(LocalStoreConfig::default(), Arc::new(NoOpEncryptor)).await?,
//! );
//! let config = SyncConfig {
//!     server_url: "https://relief.example.org".to_string(),
//!     ..Default::default()
//! };
//! let client = Arc::new(HttpReconcileClient::new(&config)?);
//! let connectivity = Arc::new(ConnectivityMonitor::new());
//!
//! let engine = Arc::new(SyncEngine::new(store, client, connectivity.clone(), config).await?);
//! Arc::clone(&engine).start().await;
//!
//! // The probe or platform callback reports connectivity; the engine
//! // drains the queue on its own from here.
//! connectivity.set_online(true);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod local_db;
pub mod scheduler;
pub mod transport;

pub use audit::{ConflictAudit, ConflictRecord};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityStatus};
pub use engine::{QueueStatus, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use events::{SyncEvent, SyncEventBus};
pub use local_db::{
    ChangeAction, EntityKind, EntitySyncStatus, FailedItem, LocalStore, LocalStoreConfig,
    QueueItem, StoredEntity,
};
pub use transport::{
    BatchRequest, ChangeRecord, HttpReconcileClient, ItemOutcome, OutcomeStatus, ReconcileClient,
};
