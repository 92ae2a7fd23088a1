//! Sync engine coordinating the local queue with the server of record
//!
//! Responsibilities:
//! - Drain ready changes in priority order, capped per batch
//! - Apply per-item outcomes: confirm, resolve conflicts, reschedule
//! - Back off failed items and dead-letter them after the retry budget
//! - Drain immediately when connectivity returns
//! - Run a periodic sweep so nothing waits longer than one interval
//!
//! At most one sync cycle runs at a time. Everything else (timers, the
//! sweep, reconnect triggers, explicit calls) funnels through the same
//! guard and simply yields when a cycle is already running.

use crate::audit::{ConflictAudit, ConflictRecord};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEvent, SyncEventBus};
use crate::local_db::{LocalStore, QueueItem};
use crate::scheduler::RetryScheduler;
use crate::transport::{ChangeRecord, ItemOutcome, OutcomeStatus, ReconcileClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tally of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items sent to the server
    pub submitted: usize,
    /// Items the server accepted
    pub synced: usize,
    /// Items resolved by taking the server copy
    pub conflicts_resolved: usize,
    /// Items that failed this cycle (rescheduled or dead-lettered)
    pub failed: usize,
}

/// Point-in-time queue diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Items in the live queue, including ones waiting out a backoff
    pub total: i64,
    /// Items eligible to send right now
    pub ready: i64,
    /// Items in the failed queue
    pub failed: i64,
    /// Enqueue time of the oldest live item
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    /// Last reported connectivity
    pub is_online: bool,
    /// Whether a sync cycle is running at this instant
    pub sync_in_flight: bool,
}

/// Releases the in-flight flag on every exit path
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Offline-first sync engine
pub struct SyncEngine {
    store: Arc<LocalStore>,
    client: Arc<dyn ReconcileClient>,
    connectivity: Arc<ConnectivityMonitor>,
    audit: Arc<ConflictAudit>,
    events: SyncEventBus,
    config: SyncConfig,
    sync_in_flight: AtomicBool,
    scheduler: Mutex<RetryScheduler>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wire an engine to its store, transport and connectivity source.
    /// The conflict log lives in the store's database.
    pub async fn new(
        store: Arc<LocalStore>,
        client: Arc<dyn ReconcileClient>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let audit = Arc::new(ConflictAudit::new(store.pool().clone(), store.encryptor()).await?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            store,
            client,
            connectivity,
            audit,
            events: SyncEventBus::default(),
            config,
            sync_in_flight: AtomicBool::new(false),
            scheduler: Mutex::new(RetryScheduler::new()),
            shutdown_tx,
            driver: Mutex::new(None),
        })
    }

    /// Run one full sync cycle now
    pub async fn trigger_sync(&self) -> SyncResult<SyncReport> {
        self.sync_batch(None).await
    }

    /// Run one sync cycle, optionally capped below the configured batch
    /// size.
    ///
    /// Offline is not an error: the queue simply keeps the changes and
    /// an empty report is returned. A cycle already in flight is
    /// reported as [`SyncError::SyncInProgress`].
    pub async fn sync_batch(&self, limit: Option<usize>) -> SyncResult<SyncReport> {
        if !self.connectivity.is_online() {
            tracing::debug!("Sync requested while offline, nothing sent");
            return Ok(SyncReport::default());
        }

        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let _guard = InFlightGuard(&self.sync_in_flight);

        let cap = limit.map_or(self.config.max_batch_size, |l| {
            l.min(self.config.max_batch_size)
        });
        let batch = self.store.ready_batch(cap as i64).await?;
        if batch.is_empty() {
            return Ok(SyncReport::default());
        }

        self.submit_and_dispatch(batch).await
    }

    /// Retry a single change by id, if it is still queued and due.
    ///
    /// This is the retry timer's path; it shares the in-flight guard
    /// with full cycles.
    pub async fn sync_item(&self, change_id: Uuid) -> SyncResult<SyncReport> {
        if !self.connectivity.is_online() {
            tracing::debug!(change_id = %change_id, "Retry due while offline, item stays queued");
            return Ok(SyncReport::default());
        }

        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let _guard = InFlightGuard(&self.sync_in_flight);

        let item = match self.store.ready_item(change_id).await? {
            Some(item) => item,
            None => {
                // Already resolved, rescheduled or dead-lettered
                tracing::debug!(change_id = %change_id, "Retry fired for an item no longer due");
                return Ok(SyncReport::default());
            }
        };

        self.submit_and_dispatch(vec![item]).await
    }

    /// Submit a batch and apply the server's verdicts.
    ///
    /// Outcomes are applied in submission order. A transport error, a
    /// non-2xx reply or a miscounted outcome list fails the whole batch
    /// and every item goes through the retry path.
    async fn submit_and_dispatch(&self, batch: Vec<QueueItem>) -> SyncResult<SyncReport> {
        let mut report = SyncReport {
            submitted: batch.len(),
            ..Default::default()
        };

        self.events.publish(SyncEvent::SyncStarted {
            batch_size: batch.len(),
        });
        tracing::info!(batch_size = batch.len(), "Submitting sync batch");

        let changes: Vec<ChangeRecord> = batch
            .iter()
            .map(|item| ChangeRecord {
                kind: item.kind,
                action: item.action,
                data: item.data.clone(),
                offline_id: item.id,
                version_number: item.version_number,
                entity_uuid: item.entity_uuid,
            })
            .collect();

        match self.client.submit_batch(&changes).await {
            Ok(outcomes) if outcomes.len() == batch.len() => {
                for (item, outcome) in batch.iter().zip(outcomes.iter()) {
                    self.dispatch_outcome(item, outcome, &mut report).await?;
                }
            }
            Ok(outcomes) => {
                tracing::warn!(
                    expected = batch.len(),
                    got = outcomes.len(),
                    "Outcome count does not match batch, treating as batch failure"
                );
                for item in &batch {
                    self.handle_failure(item, "Outcome count mismatch", &mut report)
                        .await?;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, batch_size = batch.len(), "Batch submission failed");
                let reason = e.to_string();
                for item in &batch {
                    self.handle_failure(item, &reason, &mut report).await?;
                }
            }
        }

        self.events.publish(SyncEvent::SyncCompleted {
            synced: report.synced,
            conflicts: report.conflicts_resolved,
            failed: report.failed,
        });
        tracing::info!(
            submitted = report.submitted,
            synced = report.synced,
            conflicts = report.conflicts_resolved,
            failed = report.failed,
            "Sync cycle finished"
        );

        Ok(report)
    }

    async fn dispatch_outcome(
        &self,
        item: &QueueItem,
        outcome: &ItemOutcome,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        if outcome.offline_id != item.id {
            tracing::warn!(
                change_id = %item.id,
                outcome_id = %outcome.offline_id,
                "Outcome id differs from submitted change, applying positionally"
            );
        }

        match outcome.status {
            OutcomeStatus::Success => self.handle_success(item, outcome, report).await,
            OutcomeStatus::Conflict => self.handle_conflict(item, outcome, report).await,
            OutcomeStatus::Failed => {
                let reason = outcome.message.as_deref().unwrap_or("Rejected by server");
                self.handle_failure(item, reason, report).await
            }
        }
    }

    async fn handle_success(
        &self,
        item: &QueueItem,
        outcome: &ItemOutcome,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let server_id = match &outcome.server_id {
            Some(id) => id,
            None => {
                tracing::warn!(change_id = %item.id, "Success outcome without serverId");
                return self
                    .handle_failure(item, "Success outcome missing serverId", report)
                    .await;
            }
        };

        self.store
            .mark_entity_synced(item.kind, item.entity_uuid, server_id)
            .await?;
        self.store.remove_queue_item(item.id).await?;
        self.scheduler.lock().await.cancel(item.id);

        self.events.publish(SyncEvent::ItemSynced {
            change_id: item.id,
            entity_uuid: item.entity_uuid,
            server_id: server_id.clone(),
        });
        tracing::debug!(
            change_id = %item.id,
            server_id = %server_id,
            "Change accepted by server"
        );
        report.synced += 1;
        Ok(())
    }

    async fn handle_conflict(
        &self,
        item: &QueueItem,
        outcome: &ItemOutcome,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let server_data = match &outcome.conflict_data {
            Some(data) => data,
            None => {
                tracing::warn!(change_id = %item.id, "Conflict outcome without conflictData");
                return self
                    .handle_failure(item, "Conflict outcome missing conflictData", report)
                    .await;
            }
        };

        if let Err(e) = self
            .store
            .apply_server_copy(
                item.kind,
                item.entity_uuid,
                server_data,
                outcome.server_id.as_deref(),
            )
            .await
        {
            tracing::warn!(change_id = %item.id, error = %e, "Failed to apply server copy");
            return self
                .handle_failure(item, &format!("Conflict resolution failed: {}", e), report)
                .await;
        }

        // The resolution stands even if the audit append fails; the
        // change must not be resubmitted once the server copy is in
        if let Err(e) = self
            .audit
            .record(
                item.kind,
                item.entity_uuid,
                item.id,
                item.version_number,
                &item.data,
                server_data,
                outcome.server_id.as_deref(),
            )
            .await
        {
            tracing::error!(change_id = %item.id, error = %e, "Failed to record conflict resolution");
        }

        self.store.remove_queue_item(item.id).await?;
        self.scheduler.lock().await.cancel(item.id);

        self.events.publish(SyncEvent::ConflictResolved {
            change_id: item.id,
            entity_uuid: item.entity_uuid,
        });
        tracing::info!(
            change_id = %item.id,
            entity_uuid = %item.entity_uuid,
            "Conflict resolved with server copy"
        );
        report.conflicts_resolved += 1;
        Ok(())
    }

    /// Reschedule a failed item with backoff, or dead-letter it once
    /// the retry budget is spent
    async fn handle_failure(
        &self,
        item: &QueueItem,
        reason: &str,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let attempts = item.attempts + 1;
        report.failed += 1;

        if attempts >= self.config.max_retries as i32 {
            self.store
                .mark_entity_failed(item.kind, item.entity_uuid)
                .await?;
            self.store.dead_letter(item.id, attempts, reason).await?;
            self.scheduler.lock().await.cancel(item.id);

            self.events.publish(SyncEvent::ItemDeadLettered {
                change_id: item.id,
                entity_uuid: item.entity_uuid,
            });
            tracing::warn!(
                change_id = %item.id,
                entity_uuid = %item.entity_uuid,
                attempts,
                reason,
                "Change exhausted its retries, moved to failed queue"
            );
            return Ok(());
        }

        let delay = self.config.backoff_delay(attempts as u32);
        let now = Utc::now();
        let next_retry = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| SyncError::Internal(format!("Retry delay out of range: {}", e)))?;

        self.store
            .update_queue_schedule(item.id, attempts, now, Some(next_retry), reason)
            .await?;
        self.scheduler.lock().await.schedule(item.id, next_retry);

        self.events.publish(SyncEvent::RetryScheduled {
            change_id: item.id,
            attempts,
            next_retry,
        });
        tracing::debug!(
            change_id = %item.id,
            attempts,
            next_retry = %next_retry,
            reason,
            "Retry scheduled"
        );
        Ok(())
    }

    /// Fire every due retry timer.
    ///
    /// Due entries are consumed from the heap first. If the device is
    /// offline they are not re-armed: their `next_retry` is already in
    /// the past, so the reconnect drain or the periodic sweep will send
    /// them.
    async fn run_due_retries(&self) {
        let due = self.scheduler.lock().await.take_due(Utc::now());
        if due.is_empty() {
            return;
        }

        if !self.connectivity.is_online() {
            tracing::debug!(count = due.len(), "Retries due while offline, queue untouched");
            return;
        }

        for change_id in due {
            match self.sync_item(change_id).await {
                Ok(_) | Err(SyncError::SyncInProgress) => {}
                Err(e) => {
                    tracing::warn!(change_id = %change_id, error = %e, "Retry attempt failed");
                }
            }
        }
    }

    /// Background trigger: losing to the guard or failing is logged,
    /// never propagated
    async fn try_trigger(&self) {
        match self.trigger_sync().await {
            Ok(_) => {}
            Err(SyncError::SyncInProgress) => {
                tracing::debug!("Sync already in progress, skipping trigger");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Background sync failed");
            }
        }
    }

    /// Queue diagnostics; reads only, never triggers work
    pub async fn queue_status(&self) -> SyncResult<QueueStatus> {
        let counts = self
            .store
            .queue_counts(Utc::now(), self.config.max_retries as i32)
            .await?;

        Ok(QueueStatus {
            total: counts.total,
            ready: counts.ready,
            failed: counts.failed,
            oldest_enqueued_at: counts.oldest_enqueued_at,
            is_online: self.connectivity.is_online(),
            sync_in_flight: self.sync_in_flight.load(Ordering::SeqCst),
        })
    }

    /// Return every dead-lettered change to the live queue with a
    /// fresh retry budget, then drain if online. Returns how many came
    /// back.
    pub async fn retry_failed_items(&self) -> SyncResult<u64> {
        let restored = self.store.restore_failed().await?;
        if restored > 0 {
            tracing::info!(restored, "Failed changes returned to the sync queue");
            if self.connectivity.is_online() {
                self.try_trigger().await;
            }
        }
        Ok(restored)
    }

    /// Permanently discard every dead-lettered change. Returns how many
    /// were dropped.
    pub async fn clear_failed_items(&self) -> SyncResult<u64> {
        let cleared = self.store.clear_failed().await?;
        if cleared > 0 {
            self.store.vacuum().await?;
            tracing::info!(cleared, "Failed changes permanently discarded");
        }
        Ok(cleared)
    }

    /// Recent conflict resolutions, newest first
    pub async fn conflict_history(&self, limit: i64) -> SyncResult<Vec<ConflictRecord>> {
        self.audit.recent(limit).await
    }

    /// Check the conflict log's hash chain
    pub async fn verify_conflict_log(&self) -> SyncResult<bool> {
        self.audit.verify_chain().await
    }

    /// Event stream for UIs and logging
    pub fn events(&self) -> &SyncEventBus {
        &self.events
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Spawn the background driver: periodic sweep, reconnect drain and
    /// retry timers. Call once on a cloned handle; `shutdown` stops it.
    pub async fn start(self: Arc<Self>) {
        let engine = Arc::clone(&self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            engine.drive(shutdown_rx).await;
        });
        *self.driver.lock().await = Some(handle);
        tracing::debug!("Sync driver started");
    }

    async fn drive(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        // Re-arm retry timers persisted by the previous run
        match self.store.scheduled_retries().await {
            Ok(pairs) => {
                let mut scheduler = self.scheduler.lock().await;
                for (change_id, fire_at) in pairs {
                    scheduler.schedule(change_id, fire_at);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not restore retry timers");
            }
        }

        let mut connectivity_rx = self.connectivity.subscribe();
        let mut was_online = connectivity_rx.borrow().is_online;

        // First tick fires immediately, draining any startup backlog
        let mut check = tokio::time::interval(self.config.sync_check_interval);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let retry_sleep = self.next_retry_sleep().await;

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = check.tick() => {
                    if self.connectivity.is_online() {
                        match self.store.queue_depth().await {
                            Ok(depth) if depth > 0 => self.try_trigger().await,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "Queue depth check failed");
                            }
                        }
                    }
                }
                changed = connectivity_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = connectivity_rx.borrow_and_update().is_online;
                    if is_online != was_online {
                        self.events.publish(SyncEvent::ConnectivityChanged { online: is_online });
                        if is_online {
                            tracing::info!("Connectivity restored, draining sync queue");
                            self.try_trigger().await;
                        } else {
                            tracing::info!("Connectivity lost, changes queue locally");
                        }
                        was_online = is_online;
                    }
                }
                _ = tokio::time::sleep(retry_sleep) => {
                    self.run_due_retries().await;
                }
            }
        }

        tracing::debug!("Sync driver stopped");
    }

    /// Time until the earliest armed retry; recomputed every loop turn
    /// so a newly scheduled timer is never waited past
    async fn next_retry_sleep(&self) -> std::time::Duration {
        const IDLE: std::time::Duration = std::time::Duration::from_secs(3600);
        match self.scheduler.lock().await.next_fire_at() {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            None => IDLE,
        }
    }

    /// Stop the background driver and drop armed timers. Queue state
    /// stays in the store; a later `start` re-arms from it.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sync driver ended abnormally");
            }
        }
        self.scheduler.lock().await.clear();
        tracing::info!("Sync engine stopped");
    }
}
