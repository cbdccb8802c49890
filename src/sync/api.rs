//! Sync API Client - REST implementation of the repository boundary
//!
//! Endpoints (relative to the configured base URL):
//! - `POST /sync/operations` - push a batch of sealed operations
//! - `GET  /sync/changes?userId&since&limit` - incremental pull
//! - `GET  /sync/version?userId` - latest version in the log
//! - `GET|PUT /sync/metadata/{userId}` - remote sync cursor
//!
//! The live feed is served by polling `/sync/changes` in a background task.

use super::models::{SyncOperation, SyncState, WireOperation};
use super::repository::{
    ChangeCallback, PushResult, Repository, RepositoryError, Subscription, SyncMetadata,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRepositoryConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_page_size: usize,
}

impl Default for HttpRepositoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            timeout_secs: 30,
            poll_interval_secs: 5,
            poll_page_size: 100,
        }
    }
}

impl HttpRepositoryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// REST client for the remote operation log
#[derive(Clone)]
pub struct HttpRepository {
    client: Client,
    base_url: Url,
    poll_interval: Duration,
    poll_page_size: usize,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpRepository {
    pub fn new(config: HttpRepositoryConfig) -> Result<Self, RepositoryError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RepositoryError::Transport(format!("invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RepositoryError::Transport(format!(
                "invalid base URL: {}",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RepositoryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            poll_page_size: config.poll_page_size.max(1),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RepositoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RepositoryError::Transport("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RepositoryError> {
        let token = self.get_token().await.ok_or(RepositoryError::Unauthorized)?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl Repository for HttpRepository {
    async fn push_operations(
        &self,
        operations: &[SyncOperation],
    ) -> Result<Vec<PushResult>, RepositoryError> {
        let body = PushRequest {
            operations: operations.iter().map(WireOperation::from).collect(),
        };
        let request = self.client.post(self.endpoint(&["sync", "operations"])?).json(&body);
        let response = self.authorized(request).await?.send().await.map_err(request_error)?;

        let parsed: PushResponse = handle_response(response).await?;
        log::debug!("Pushed {} operations", parsed.results.len());
        Ok(parsed.results)
    }

    async fn pull_changes(
        &self,
        user_id: &str,
        since_version: i64,
        limit: usize,
    ) -> Result<Vec<WireOperation>, RepositoryError> {
        let request = self
            .client
            .get(self.endpoint(&["sync", "changes"])?)
            .query(&[
                ("userId", user_id.to_string()),
                ("since", since_version.to_string()),
                ("limit", limit.to_string()),
            ]);
        let response = self.authorized(request).await?.send().await.map_err(request_error)?;

        let parsed: ChangesResponse = handle_response(response).await?;

        // Keep the page length intact; records with a broken shape are
        // flagged and rejected by validation downstream
        let mut unreadable = 0;
        let operations: Vec<WireOperation> = parsed
            .operations
            .into_iter()
            .map(|value| match serde_json::from_value::<WireOperation>(value.clone()) {
                Ok(op) => op,
                Err(e) => {
                    unreadable += 1;
                    unreadable_record(&value, e.to_string())
                }
            })
            .collect();

        if unreadable > 0 {
            log::warn!(
                "Pulled {} operations, {} unreadable",
                operations.len(),
                unreadable
            );
        }
        Ok(operations)
    }

    async fn get_latest_version(&self, user_id: &str) -> Result<i64, RepositoryError> {
        let request = self
            .client
            .get(self.endpoint(&["sync", "version"])?)
            .query(&[("userId", user_id)]);
        let response = self.authorized(request).await?.send().await.map_err(request_error)?;

        let parsed: VersionResponse = handle_response(response).await?;
        Ok(parsed.version)
    }

    async fn get_sync_metadata(&self, user_id: &str) -> Result<Option<SyncMetadata>, RepositoryError> {
        let request = self.client.get(self.endpoint(&["sync", "metadata", user_id])?);
        let response = self.authorized(request).await?.send().await.map_err(request_error)?;

        // Handle 404 as no metadata (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        handle_response(response).await.map(Some)
    }

    async fn upsert_sync_metadata(
        &self,
        user_id: &str,
        status: SyncState,
        last_sync_version: i64,
    ) -> Result<(), RepositoryError> {
        let body = SyncMetadata {
            last_sync_version,
            sync_status: Some(status),
        };
        let request = self
            .client
            .put(self.endpoint(&["sync", "metadata", user_id])?)
            .json(&body);
        let response = self.authorized(request).await?.send().await.map_err(request_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn subscribe_to_changes(
        &self,
        user_id: &str,
        callback: ChangeCallback,
    ) -> Result<Subscription, RepositoryError> {
        let start_version = self.get_latest_version(user_id).await?;
        let repo = self.clone();
        let user_id = user_id.to_string();

        log::info!(
            "Polling {} for changes every {:?} from version {}",
            repo.base_url,
            repo.poll_interval,
            start_version
        );

        let handle = tokio::spawn(async move {
            let mut cursor = start_version;
            let mut interval = tokio::time::interval(repo.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                match repo.pull_changes(&user_id, cursor, repo.poll_page_size).await {
                    Ok(operations) => {
                        for op in operations {
                            cursor = cursor.max(op.version);
                            callback(op);
                        }
                    }
                    Err(e) => log::warn!("Change poll failed: {}", e),
                }
            }
        });

        Ok(Subscription::new(move || handle.abort()))
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct PushRequest {
    operations: Vec<WireOperation>,
}

#[derive(Debug, Clone, Deserialize)]
struct PushResponse {
    results: Vec<PushResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChangesResponse {
    operations: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct VersionResponse {
    version: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Salvage what identifies a record that failed to decode
fn unreadable_record(value: &serde_json::Value, reason: String) -> WireOperation {
    let text = |field: &str| {
        value
            .get(field)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    WireOperation {
        id: text("id"),
        user_id: text("userId"),
        session_id: text("sessionId"),
        operation_type: text("operationType"),
        entity_type: text("entityType"),
        entity_id: text("entityId"),
        encrypted_payload: text("encryptedPayload"),
        version: value
            .get("version")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0),
        timestamp: DateTime::<Utc>::default(),
        malformed: Some(reason),
    }
}

// ============================================================================
// Error Handling
// ============================================================================

fn request_error(e: reqwest::Error) -> RepositoryError {
    if e.is_timeout() {
        RepositoryError::Timeout
    } else if e.is_decode() {
        RepositoryError::InvalidResponse(e.to_string())
    } else {
        RepositoryError::Transport(e.to_string())
    }
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RepositoryError> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| RepositoryError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to RepositoryError
async fn handle_error(response: reqwest::Response) -> RepositoryError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RepositoryError::Unauthorized,
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => RepositoryError::Server {
            status: s.as_u16(),
            message: error_message(response).await,
        },
        _ => RepositoryError::InvalidResponse(format!("{}: {}", status, error_message(response).await)),
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text)
}

// ============================================================================
// Tests
// ============================================================================
