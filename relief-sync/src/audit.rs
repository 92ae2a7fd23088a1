//! Tamper-evident log of conflict resolutions
//!
//! Every time the server copy overwrites a local edit, the discarded
//! local payload and the winning server payload are appended here with
//! a SHA-256 hash chain. Field teams can later answer "what did this
//! device write before the server won" even though the entity row now
//! holds the server copy.
//!
//! Payloads are stored encrypted with the same encryptor as the main
//! store, and the chain hashes the sealed text. Integrity can therefore
//! be verified without the encryption key.

use crate::error::{SyncError, SyncResult};
use crate::local_db::EntityKind;
use chrono::{DateTime, Utc};
use crypto::Encryptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One resolved conflict, decrypted for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Unique record id
    pub id: Uuid,

    /// When the resolution was applied
    pub recorded_at: DateTime<Utc>,

    /// Entity kind
    pub kind: EntityKind,

    /// Entity the conflict was about
    pub entity_uuid: Uuid,

    /// Change whose submission surfaced the conflict
    pub change_id: Uuid,

    /// Local version counter of the losing write
    pub local_version: i64,

    /// The local payload that was overwritten
    pub local_data: serde_json::Value,

    /// The server payload that won
    pub server_data: serde_json::Value,

    /// Server identifier, when the outcome carried one
    pub server_id: Option<String>,

    /// Hash of the previous record (chain link)
    pub prev_hash: String,

    /// Hash of this record
    pub entry_hash: String,
}

/// Append-only conflict log sharing the store's database and encryptor
pub struct ConflictAudit {
    pool: SqlitePool,
    encryptor: Arc<dyn Encryptor>,
    last_hash: Mutex<String>,
}

impl ConflictAudit {
    /// Open the conflict log, creating its table if needed and picking
    /// the chain up where the last run left it
    pub async fn new(pool: SqlitePool, encryptor: Arc<dyn Encryptor>) -> SyncResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_audit (
                id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                kind TEXT NOT NULL,
                entity_uuid TEXT NOT NULL,
                change_id TEXT NOT NULL,
                local_version INTEGER NOT NULL,
                local_data TEXT NOT NULL,
                server_data TEXT NOT NULL,
                server_id TEXT,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conflict_audit_entity ON conflict_audit(entity_uuid)",
        )
        .execute(&pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT entry_hash FROM conflict_audit
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await?;

        let last_hash = match row {
            Some(row) => row.try_get("entry_hash")?,
            None => "0".to_string(), // Genesis hash
        };

        Ok(Self {
            pool,
            encryptor,
            last_hash: Mutex::new(last_hash),
        })
    }

    /// Append a resolution to the chain. Returns the record id.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        kind: EntityKind,
        entity_uuid: Uuid,
        change_id: Uuid,
        local_version: i64,
        local_data: &serde_json::Value,
        server_data: &serde_json::Value,
        server_id: Option<&str>,
    ) -> SyncResult<Uuid> {
        let id = Uuid::new_v4();
        let recorded_at = Utc::now();
        let sealed_local = self.encryptor.encrypt(&local_data.to_string())?;
        let sealed_server = self.encryptor.encrypt(&server_data.to_string())?;

        // Lock held across the insert so concurrent resolutions cannot
        // fork the chain
        let mut last_hash = self.last_hash.lock().await;

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(recorded_at.to_rfc3339().as_bytes());
        hasher.update(kind.as_str().as_bytes());
        hasher.update(entity_uuid.as_bytes());
        hasher.update(change_id.as_bytes());
        hasher.update(local_version.to_string().as_bytes());
        hasher.update(sealed_local.as_bytes());
        hasher.update(sealed_server.as_bytes());
        hasher.update(server_id.unwrap_or("").as_bytes());
        hasher.update(last_hash.as_bytes());
        let entry_hash = format!("{:x}", hasher.finalize());

        sqlx::query(
            r#"
            INSERT INTO conflict_audit (
                id, recorded_at, kind, entity_uuid, change_id, local_version,
                local_data, server_data, server_id, prev_hash, entry_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(recorded_at.to_rfc3339())
        .bind(kind.as_str())
        .bind(entity_uuid.to_string())
        .bind(change_id.to_string())
        .bind(local_version)
        .bind(&sealed_local)
        .bind(&sealed_server)
        .bind(server_id)
        .bind(last_hash.as_str())
        .bind(&entry_hash)
        .execute(&self.pool)
        .await?;

        *last_hash = entry_hash;

        tracing::debug!(
            record_id = %id,
            change_id = %change_id,
            entity_uuid = %entity_uuid,
            "Conflict resolution recorded"
        );

        Ok(id)
    }

    /// Walk the whole chain recomputing every hash. The sealed payloads
    /// are hashed as stored, so no decryption happens here.
    pub async fn verify_chain(&self) -> SyncResult<bool> {
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at, kind, entity_uuid, change_id, local_version,
                   local_data, server_data, server_id, prev_hash, entry_hash
            FROM conflict_audit
            ORDER BY recorded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expected_prev_hash = "0".to_string();

        for row in rows {
            let prev_hash: String = row.try_get("prev_hash")?;
            let entry_hash: String = row.try_get("entry_hash")?;

            if prev_hash != expected_prev_hash {
                return Ok(false);
            }

            let id: String = row.try_get("id")?;
            let recorded_at: String = row.try_get("recorded_at")?;
            let kind: String = row.try_get("kind")?;
            let entity_uuid: String = row.try_get("entity_uuid")?;
            let change_id: String = row.try_get("change_id")?;
            let local_version: i64 = row.try_get("local_version")?;
            let local_data: String = row.try_get("local_data")?;
            let server_data: String = row.try_get("server_data")?;
            let server_id: Option<String> = row.try_get("server_id")?;

            let mut hasher = Sha256::new();
            hasher.update(parse_uuid(&id)?.as_bytes());
            hasher.update(recorded_at.as_bytes());
            hasher.update(kind.as_bytes());
            hasher.update(parse_uuid(&entity_uuid)?.as_bytes());
            hasher.update(parse_uuid(&change_id)?.as_bytes());
            hasher.update(local_version.to_string().as_bytes());
            hasher.update(local_data.as_bytes());
            hasher.update(server_data.as_bytes());
            hasher.update(server_id.as_deref().unwrap_or("").as_bytes());
            hasher.update(prev_hash.as_bytes());
            let calculated_hash = format!("{:x}", hasher.finalize());

            if calculated_hash != entry_hash {
                return Ok(false);
            }

            expected_prev_hash = entry_hash;
        }

        Ok(true)
    }

    /// Most recent resolutions, newest first, payloads decrypted
    pub async fn recent(&self, limit: i64) -> SyncResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, recorded_at, kind, entity_uuid, change_id, local_version,
                   local_data, server_data, server_id, prev_hash, entry_hash
            FROM conflict_audit
            ORDER BY recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let recorded_at: String = row.try_get("recorded_at")?;
            let kind: String = row.try_get("kind")?;
            let entity_uuid: String = row.try_get("entity_uuid")?;
            let change_id: String = row.try_get("change_id")?;
            let local_data: String = row.try_get("local_data")?;
            let server_data: String = row.try_get("server_data")?;

            records.push(ConflictRecord {
                id: parse_uuid(&id)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))?
                    .with_timezone(&Utc),
                kind: EntityKind::from_str(&kind)?,
                entity_uuid: parse_uuid(&entity_uuid)?,
                change_id: parse_uuid(&change_id)?,
                local_version: row.try_get("local_version")?,
                local_data: self.decrypt_value(&local_data)?,
                server_data: self.decrypt_value(&server_data)?,
                server_id: row.try_get("server_id")?,
                prev_hash: row.try_get("prev_hash")?,
                entry_hash: row.try_get("entry_hash")?,
            });
        }

        Ok(records)
    }

    fn decrypt_value(&self, sealed: &str) -> SyncResult<serde_json::Value> {
        let plain = self.encryptor.decrypt(sealed)?;
        Ok(serde_json::from_str(&plain)?)
    }
}

fn parse_uuid(s: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::Internal(format!("Invalid UUID: {}", e)))
}
