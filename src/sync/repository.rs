//! Repository Adapter boundary
//!
//! The orchestrator talks to the remote operation log only through
//! [`Repository`]. The REST implementation lives in `sync::api`; tests plug in
//! in-memory doubles.

use super::models::{SyncOperation, SyncState, WireOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Per-operation outcome of a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub operation_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PushResult {
    pub fn ok(operation_id: Uuid) -> Self {
        Self {
            operation_id,
            success: true,
            error: None,
        }
    }

    pub fn failed(operation_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            operation_id,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Remote sync cursor for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub last_sync_version: i64,
    #[serde(default)]
    pub sync_status: Option<SyncState>,
}

/// Callback invoked for every operation on the live feed
pub type ChangeCallback = Arc<dyn Fn(WireOperation) + Send + Sync>;

/// Handle to a live-feed subscription
///
/// Unsubscribes on [`Subscription::unsubscribe`] or when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to release
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Remote operation log
#[async_trait]
pub trait Repository: Send + Sync {
    /// Push a batch; one result per operation the store processed
    async fn push_operations(
        &self,
        operations: &[SyncOperation],
    ) -> Result<Vec<PushResult>, RepositoryError>;

    /// Operations with `version > since_version`, ascending, at most `limit`
    async fn pull_changes(
        &self,
        user_id: &str,
        since_version: i64,
        limit: usize,
    ) -> Result<Vec<WireOperation>, RepositoryError>;

    async fn get_latest_version(&self, user_id: &str) -> Result<i64, RepositoryError>;

    /// `None` when the store has never seen this user
    async fn get_sync_metadata(&self, user_id: &str) -> Result<Option<SyncMetadata>, RepositoryError>;

    async fn upsert_sync_metadata(
        &self,
        user_id: &str,
        status: SyncState,
        last_sync_version: i64,
    ) -> Result<(), RepositoryError>;

    /// Register a live-feed callback for operations written by other sessions
    async fn subscribe_to_changes(
        &self,
        user_id: &str,
        callback: ChangeCallback,
    ) -> Result<Subscription, RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl RepositoryError {
    /// Whether a later attempt can succeed without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::Server { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cancels_once_on_unsubscribe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_cancels_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RepositoryError::Timeout.is_retryable());
        assert!(RepositoryError::Transport("reset".into()).is_retryable());
        assert!(RepositoryError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!RepositoryError::Unauthorized.is_retryable());
        assert!(!RepositoryError::InvalidResponse("eof".into()).is_retryable());
    }

    #[test]
    fn test_push_result_json() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(PushResult::failed(id, "conflict")).unwrap();
        assert_eq!(json["operationId"], id.to_string());
        assert_eq!(json["success"], false);

        let parsed: PushResult =
            serde_json::from_str(&format!(r#"{{"operationId":"{}","success":true}}"#, id)).unwrap();
        assert_eq!(parsed, PushResult::ok(id));
    }
}
