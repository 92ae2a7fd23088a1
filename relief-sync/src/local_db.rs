//! Local SQLite store for offline-first field operations
//!
//! Provides:
//! - Per-kind entity tables (assessments, responses, entities) with a
//!   sync status on every row
//! - The durable sync queue of pending outbound changes
//! - A dead-letter table for changes that exhausted their retries
//! - Transparent payload encryption at rest
//!
//! The store is the single source of truth for "what the server has not
//! confirmed yet". Entity content may be rewritten by application code
//! at any time; queue scheduling fields and sync status are written only
//! by the sync engine.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use crypto::Encryptor;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::sync::Arc;
use uuid::Uuid;

/// Configuration for the local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Path to the database file
    pub db_path: String,
    /// Identifier of this field device
    pub device_id: Uuid,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "relief_local.db".to_string(),
            device_id: Uuid::new_v4(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Kind of domain entity a change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Assessment,
    Response,
    Entity,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Assessment,
        EntityKind::Response,
        EntityKind::Entity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Assessment => "assessment",
            EntityKind::Response => "response",
            EntityKind::Entity => "entity",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "assessment" => Ok(EntityKind::Assessment),
            "response" => Ok(EntityKind::Response),
            "entity" => Ok(EntityKind::Entity),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown entity kind: {}",
                s
            ))),
        }
    }

    /// Table holding rows of this kind
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Assessment => "assessments",
            EntityKind::Response => "responses",
            EntityKind::Entity => "entities",
        }
    }
}

/// Action a change performs on its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(ChangeAction::Create),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown change action: {}",
                s
            ))),
        }
    }
}

/// Sync state of a locally stored entity row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySyncStatus {
    /// Written locally, not yet confirmed by the server
    Pending,
    /// Confirmed by the server (possibly via conflict resolution)
    Synced,
    /// Retries exhausted; waiting for an operator action
    Failed,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(EntitySyncStatus::Pending),
            "synced" => Ok(EntitySyncStatus::Synced),
            "failed" => Ok(EntitySyncStatus::Failed),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown sync status: {}",
                s
            ))),
        }
    }
}

/// One pending change in the sync queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Client-generated change id, echoed by the server as `offlineId`
    pub id: Uuid,

    /// Stable client-assigned identifier of the entity
    pub entity_uuid: Uuid,

    /// Entity kind
    pub kind: EntityKind,

    /// Action performed
    pub action: ChangeAction,

    /// Decrypted payload
    pub data: serde_json::Value,

    /// Local version counter of the entity at staging time
    pub version_number: i64,

    /// Higher runs sooner
    pub priority: i32,

    /// Number of failed attempts so far
    pub attempts: i32,

    /// When the change was staged
    pub enqueued_at: DateTime<Utc>,

    /// When the last attempt ran
    pub last_attempt: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may run
    pub next_retry: Option<DateTime<Utc>>,

    /// Last failure message
    pub last_error: Option<String>,
}

/// A change that exhausted its retries and left the live queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: Uuid,
    pub entity_uuid: Uuid,
    pub kind: EntityKind,
    pub action: ChangeAction,
    pub data: serde_json::Value,
    pub version_number: i64,
    pub priority: i32,
    pub attempts: i32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// A locally stored entity row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntity {
    pub uuid: Uuid,
    pub kind: EntityKind,
    pub version_number: i64,
    pub data: serde_json::Value,
    pub sync_status: EntitySyncStatus,
    pub server_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate queue counters for diagnostics
#[derive(Debug, Clone)]
pub struct QueueCounts {
    pub total: i64,
    pub ready: i64,
    pub failed: i64,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

/// Local durable store handle
pub struct LocalStore {
    pool: SqlitePool,
    device_id: Uuid,
    encryptor: Arc<dyn Encryptor>,
}

impl LocalStore {
    /// Open (creating if missing) the local store
    pub async fn new(config: LocalStoreConfig, encryptor: Arc<dyn Encryptor>) -> SyncResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        // WAL keeps readers (status queries) from blocking the engine's writes
        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let store = Self {
            pool,
            device_id: config.device_id,
            encryptor,
        };

        store.initialize_schema().await?;

        tracing::debug!(
            device_id = %store.device_id,
            db_path = %config.db_path,
            algorithm = store.encryptor.algorithm(),
            "Local store opened"
        );

        Ok(store)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    uuid TEXT PRIMARY KEY,
                    version_number INTEGER NOT NULL DEFAULT 1,
                    data TEXT NOT NULL,
                    sync_status TEXT NOT NULL DEFAULT 'pending',
                    server_id TEXT,
                    updated_at TEXT NOT NULL
                )
                "#,
                kind.table()
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_sync_status ON {0}(sync_status)",
                kind.table()
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                entity_uuid TEXT NOT NULL,
                kind TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                last_attempt TEXT,
                next_retry TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_ready ON sync_queue(next_retry)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_uuid)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failed_queue (
                id TEXT PRIMARY KEY,
                entity_uuid TEXT NOT NULL,
                kind TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                last_error TEXT,
                failed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn encrypt_payload(&self, data: &serde_json::Value) -> SyncResult<String> {
        Ok(self.encryptor.encrypt(&data.to_string())?)
    }

    fn decrypt_payload(&self, stored: &str) -> SyncResult<serde_json::Value> {
        let plain = self.encryptor.decrypt(stored)?;
        Ok(serde_json::from_str(&plain)?)
    }

    /// Stage a local mutation: write the entity row optimistically and
    /// enqueue the outbound change in one transaction.
    ///
    /// Returns the client-generated change id. A storage failure here is
    /// propagated to the caller; losing the ability to queue at all is
    /// worse than a transmission failure and must not be swallowed.
    pub async fn stage_change(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
        action: ChangeAction,
        data: serde_json::Value,
        priority: i32,
    ) -> SyncResult<Uuid> {
        let change_id = Uuid::new_v4();
        let now = Utc::now();
        let sealed = self.encrypt_payload(&data)?;

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(&format!(
            "SELECT version_number FROM {} WHERE uuid = ?",
            kind.table()
        ))
        .bind(entity_uuid.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let version = match current {
            Some(row) => row.try_get::<i64, _>("version_number")? + 1,
            None => 1,
        };

        // Existing server_id survives the upsert: the entity keeps the
        // identity the server already assigned it.
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (uuid, version_number, data, sync_status, server_id, updated_at)
            VALUES (?, ?, ?, 'pending', NULL, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                version_number = excluded.version_number,
                data = excluded.data,
                sync_status = 'pending',
                updated_at = excluded.updated_at
            "#,
            kind.table()
        ))
        .bind(entity_uuid.to_string())
        .bind(version)
        .bind(&sealed)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, entity_uuid, kind, action, data, version_number,
                priority, attempts, enqueued_at, last_attempt, next_retry, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, NULL, NULL, NULL)
            "#,
        )
        .bind(change_id.to_string())
        .bind(entity_uuid.to_string())
        .bind(kind.as_str())
        .bind(action.as_str())
        .bind(&sealed)
        .bind(version)
        .bind(priority)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            change_id = %change_id,
            entity_uuid = %entity_uuid,
            kind = kind.as_str(),
            action = action.as_str(),
            version,
            priority,
            "Staged change for sync"
        );

        Ok(change_id)
    }

    /// Drain up to `limit` ready items: `next_retry` absent or due, in
    /// priority-descending order with age as the tie-break.
    pub async fn ready_batch(&self, limit: i64) -> SyncResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, attempts, enqueued_at, last_attempt, next_retry, last_error
            FROM sync_queue
            WHERE next_retry IS NULL OR next_retry <= ?
            ORDER BY priority DESC, enqueued_at ASC
            LIMIT ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.queue_item_from_row(row)).collect()
    }

    /// Fetch one item by id if it is ready to run now
    pub async fn ready_item(&self, id: Uuid) -> SyncResult<Option<QueueItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, attempts, enqueued_at, last_attempt, next_retry, last_error
            FROM sync_queue
            WHERE id = ? AND (next_retry IS NULL OR next_retry <= ?)
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.queue_item_from_row(&r)).transpose()
    }

    /// Every queued item regardless of schedule, for diagnostics
    pub async fn queue_snapshot(&self) -> SyncResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, attempts, enqueued_at, last_attempt, next_retry, last_error
            FROM sync_queue
            ORDER BY priority DESC, enqueued_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.queue_item_from_row(row)).collect()
    }

    fn queue_item_from_row(&self, row: &SqliteRow) -> SyncResult<QueueItem> {
        let id: String = row.try_get("id")?;
        let entity_uuid: String = row.try_get("entity_uuid")?;
        let kind: String = row.try_get("kind")?;
        let action: String = row.try_get("action")?;
        let data: String = row.try_get("data")?;
        let enqueued_at: String = row.try_get("enqueued_at")?;
        let last_attempt: Option<String> = row.try_get("last_attempt")?;
        let next_retry: Option<String> = row.try_get("next_retry")?;

        Ok(QueueItem {
            id: parse_uuid(&id)?,
            entity_uuid: parse_uuid(&entity_uuid)?,
            kind: EntityKind::from_str(&kind)?,
            action: ChangeAction::from_str(&action)?,
            data: self.decrypt_payload(&data)?,
            version_number: row.try_get("version_number")?,
            priority: row.try_get("priority")?,
            attempts: row.try_get("attempts")?,
            enqueued_at: parse_timestamp(&enqueued_at)?,
            last_attempt: last_attempt.as_deref().map(parse_timestamp).transpose()?,
            next_retry: next_retry.as_deref().map(parse_timestamp).transpose()?,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Delete a queue item; removing an absent id is not an error
    pub async fn remove_queue_item(&self, id: Uuid) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a new retry schedule for an item.
    ///
    /// An id that no longer exists is logged and ignored: a parallel
    /// path may have already removed the item, and removal is the
    /// authoritative terminal state.
    pub async fn update_queue_schedule(
        &self,
        id: Uuid,
        attempts: i32,
        last_attempt: DateTime<Utc>,
        next_retry: Option<DateTime<Utc>>,
        error: &str,
    ) -> SyncResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET attempts = ?,
                last_attempt = ?,
                next_retry = ?,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(last_attempt.to_rfc3339())
        .bind(next_retry.map(|t| t.to_rfc3339()))
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                change_id = %id,
                "Schedule update for a queue item that no longer exists"
            );
        }

        Ok(())
    }

    /// Pending `(change_id, next_retry)` pairs, for re-arming timers
    /// after a restart
    pub async fn scheduled_retries(&self) -> SyncResult<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT id, next_retry FROM sync_queue WHERE next_retry IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let next_retry: String = row.try_get("next_retry")?;
            pairs.push((parse_uuid(&id)?, parse_timestamp(&next_retry)?));
        }
        Ok(pairs)
    }

    /// Number of items in the live queue
    pub async fn queue_depth(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("depth")?)
    }

    /// Aggregate counters for `queue_status`; read-only
    pub async fn queue_counts(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
    ) -> SyncResult<QueueCounts> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   MIN(enqueued_at) AS oldest
            FROM sync_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let ready = sqlx::query(
            r#"
            SELECT COUNT(*) AS ready
            FROM sync_queue
            WHERE attempts < ? AND (next_retry IS NULL OR next_retry <= ?)
            "#,
        )
        .bind(max_retries)
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let failed = sqlx::query("SELECT COUNT(*) AS failed FROM failed_queue")
            .fetch_one(&self.pool)
            .await?;

        let oldest: Option<String> = totals.try_get("oldest")?;

        Ok(QueueCounts {
            total: totals.try_get("total")?,
            ready: ready.try_get("ready")?,
            failed: failed.try_get("failed")?,
            oldest_enqueued_at: oldest.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    /// Fetch a locally stored entity row
    pub async fn get_entity(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
    ) -> SyncResult<Option<StoredEntity>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT uuid, version_number, data, sync_status, server_id, updated_at
            FROM {} WHERE uuid = ?
            "#,
            kind.table()
        ))
        .bind(entity_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let uuid: String = row.try_get("uuid")?;
        let data: String = row.try_get("data")?;
        let sync_status: String = row.try_get("sync_status")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Some(StoredEntity {
            uuid: parse_uuid(&uuid)?,
            kind,
            version_number: row.try_get("version_number")?,
            data: self.decrypt_payload(&data)?,
            sync_status: EntitySyncStatus::from_str(&sync_status)?,
            server_id: row.try_get("server_id")?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }

    /// Record server confirmation for an entity
    pub async fn mark_entity_synced(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
        server_id: &str,
    ) -> SyncResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {} SET sync_status = 'synced', server_id = ?, updated_at = ?
            WHERE uuid = ?
            "#,
            kind.table()
        ))
        .bind(server_id)
        .bind(Utc::now().to_rfc3339())
        .bind(entity_uuid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite an entity with the server's copy (last-write-wins) and
    /// mark it synced. Applying the same copy twice yields the same row.
    ///
    /// The local version counter is untouched: it numbers local
    /// mutations, and taking the server copy is not one.
    pub async fn apply_server_copy(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
        data: &serde_json::Value,
        server_id: Option<&str>,
    ) -> SyncResult<()> {
        let sealed = self.encrypt_payload(data)?;
        sqlx::query(&format!(
            r#"
            UPDATE {} SET data = ?, sync_status = 'synced',
                          server_id = COALESCE(?, server_id), updated_at = ?
            WHERE uuid = ?
            "#,
            kind.table()
        ))
        .bind(&sealed)
        .bind(server_id)
        .bind(Utc::now().to_rfc3339())
        .bind(entity_uuid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark an entity as terminally failed
    pub async fn mark_entity_failed(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
    ) -> SyncResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_status = 'failed', updated_at = ? WHERE uuid = ?",
            kind.table()
        ))
        .bind(Utc::now().to_rfc3339())
        .bind(entity_uuid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move an exhausted item from the live queue to the failed queue
    pub async fn dead_letter(&self, id: Uuid, attempts: i32, error: &str) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO failed_queue (
                id, entity_uuid, kind, action, data, version_number,
                priority, attempts, enqueued_at, last_error, failed_at
            )
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, ?, enqueued_at, ?, ?
            FROM sync_queue WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if moved.rows_affected() == 0 {
            tracing::warn!(
                change_id = %id,
                "Dead-letter requested for a queue item that no longer exists"
            );
        }

        Ok(())
    }

    /// Every dead-lettered item, newest failure first
    pub async fn failed_items(&self) -> SyncResult<Vec<FailedItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, attempts, enqueued_at, last_error, failed_at
            FROM failed_queue
            ORDER BY failed_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let entity_uuid: String = row.try_get("entity_uuid")?;
            let kind: String = row.try_get("kind")?;
            let action: String = row.try_get("action")?;
            let data: String = row.try_get("data")?;
            let enqueued_at: String = row.try_get("enqueued_at")?;
            let failed_at: String = row.try_get("failed_at")?;

            items.push(FailedItem {
                id: parse_uuid(&id)?,
                entity_uuid: parse_uuid(&entity_uuid)?,
                kind: EntityKind::from_str(&kind)?,
                action: ChangeAction::from_str(&action)?,
                data: self.decrypt_payload(&data)?,
                version_number: row.try_get("version_number")?,
                priority: row.try_get("priority")?,
                attempts: row.try_get("attempts")?,
                enqueued_at: parse_timestamp(&enqueued_at)?,
                last_error: row.try_get("last_error")?,
                failed_at: parse_timestamp(&failed_at)?,
            });
        }
        Ok(items)
    }

    /// Number of dead-lettered items
    pub async fn failed_count(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS failed FROM failed_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("failed")?)
    }

    /// Permanently delete every dead-lettered item; the explicit
    /// "give up" action
    pub async fn clear_failed(&self) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM failed_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Move every dead-lettered item back into the live queue with a
    /// fresh schedule: attempts reset, retry/error cleared, original
    /// enqueue time kept so age-based ordering still holds. The touched
    /// entities go back to `pending`.
    pub async fn restore_failed(&self) -> SyncResult<u64> {
        let mut tx = self.pool.begin().await?;

        let entities = sqlx::query("SELECT DISTINCT kind, entity_uuid FROM failed_queue")
            .fetch_all(&mut *tx)
            .await?;

        let restored = sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, entity_uuid, kind, action, data, version_number,
                priority, attempts, enqueued_at, last_attempt, next_retry, last_error
            )
            SELECT id, entity_uuid, kind, action, data, version_number,
                   priority, 0, enqueued_at, NULL, NULL, NULL
            FROM failed_queue
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM failed_queue")
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().to_rfc3339();
        for row in entities {
            let kind: String = row.try_get("kind")?;
            let entity_uuid: String = row.try_get("entity_uuid")?;
            sqlx::query(&format!(
                "UPDATE {} SET sync_status = 'pending', updated_at = ? WHERE uuid = ?",
                EntityKind::from_str(&kind)?.table()
            ))
            .bind(&now)
            .bind(&entity_uuid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(restored.rows_affected())
    }

    /// Vacuum the database to reclaim space after bulk deletions
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Identifier of this field device
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Payload encryptor shared with the audit log
    pub fn encryptor(&self) -> Arc<dyn Encryptor> {
        Arc::clone(&self.encryptor)
    }

    /// Close database connections
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_uuid(s: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::Internal(format!("Invalid UUID: {}", e)))
}

fn parse_timestamp(s: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))
}
