//! Wire protocol between field devices and the server of record
//!
//! Provides:
//! - Serde types for the batch reconciliation exchange
//! - The `ReconcileClient` trait the engine submits batches through
//! - An HTTP implementation posting to `POST /sync/batch`
//!
//! The server replies with one outcome per submitted change, in
//! submission order. Anything else (transport error, non-2xx status,
//! unparsable body) is a whole-batch failure; the engine retries every
//! item rather than guessing which ones landed.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::local_db::{ChangeAction, EntityKind};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One outbound change as the server sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Entity kind
    #[serde(rename = "type")]
    pub kind: EntityKind,

    /// Action performed
    pub action: ChangeAction,

    /// Full entity payload
    pub data: serde_json::Value,

    /// Client-generated change id, echoed back in the outcome
    pub offline_id: Uuid,

    /// Local version counter at staging time
    pub version_number: i64,

    /// Stable client-assigned entity identifier
    pub entity_uuid: Uuid,
}

/// Request body for `POST /sync/batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub changes: Vec<ChangeRecord>,
}

/// Per-item verdict from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Conflict,
    Failed,
}

/// One entry of the server's batch response, aligned positionally with
/// the submitted changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    /// Echo of the change id the outcome refers to
    pub offline_id: Uuid,

    /// Authoritative server identifier, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    pub status: OutcomeStatus,

    /// Human-readable detail, mainly on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The server's copy of the entity, present on conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_data: Option<serde_json::Value>,
}

/// Submits change batches to the server of record.
///
/// Implementations must return `Err` for anything that prevents a
/// well-formed outcome list; per-item rejections belong in the
/// outcomes, not the error channel.
#[async_trait]
pub trait ReconcileClient: Send + Sync {
    async fn submit_batch(&self, changes: &[ChangeRecord]) -> SyncResult<Vec<ItemOutcome>>;
}

/// HTTP client for the batch reconciliation endpoint
pub struct HttpReconcileClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl HttpReconcileClient {
    /// Build a client from the sync configuration
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Transmission(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }
}

#[async_trait]
impl ReconcileClient for HttpReconcileClient {
    async fn submit_batch(&self, changes: &[ChangeRecord]) -> SyncResult<Vec<ItemOutcome>> {
        let url = format!("{}/sync/batch", self.base_url);
        let body = BatchRequest {
            changes: changes.to_vec(),
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Transmission(format!("Batch submission failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Transmission(format!(
                "Batch submission failed with status: {}",
                response.status()
            )));
        }

        response
            .json::<Vec<ItemOutcome>>()
            .await
            .map_err(|e| SyncError::Transmission(format!("Malformed batch response: {}", e)))
    }
}
