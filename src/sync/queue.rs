//! Offline Queue Module - Durable store of operations awaiting confirmation
//!
//! Every locally produced operation is written here before the orchestrator
//! treats it as queued, and stays until the remote store confirms it.
//!
//! Features:
//! - SQLite-backed persistent queue (survives restarts and device sleep)
//! - Exponential backoff retry policy
//! - Max retry limit (default: 5 attempts), then permanently failed
//! - Permanently failed records stay visible for manual retry or discard
//! - Queue statistics (pending, retryable, failed counts)

use super::crypto::Payload;
use super::models::{OperationType, SyncOperation};
use crate::db::Database;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry ceiling and exponential backoff shared by both queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: std::time::Duration, max_delay: std::time::Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// `base * 2^retry_count`, capped at `max_delay`
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor).min(max_ms);
        Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            5,
            std::time::Duration::from_secs(2),
            std::time::Duration::from_secs(3600),
        )
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Queue record stored in database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
    pub operation: SyncOperation,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedOperation {
    /// Earliest moment the next attempt is allowed
    pub fn next_attempt_at(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        if self.retry_count == 0 {
            self.created_at
        } else {
            self.updated_at + policy.delay(self.retry_count)
        }
    }

    pub fn is_permanently_failed(&self, policy: &RetryPolicy) -> bool {
        policy.is_exhausted(self.retry_count)
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub retryable_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Durable offline queue for one user
pub struct OfflineQueue {
    db: Arc<Database>,
    user_id: String,
    policy: RetryPolicy,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, session_id, operation_type, entity_type, entity_id,
           payload, version, op_timestamp, retry_count, last_error,
           created_at, updated_at
    FROM sync_queue
"#;

impl OfflineQueue {
    pub fn new(db: Arc<Database>, user_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            db,
            user_id: user_id.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a new operation; returns once the row is committed
    pub fn enqueue(&self, operation: &SyncOperation) -> Result<QueuedOperation, QueueError> {
        log::info!(
            "Adding {} {} for {} to offline queue",
            operation.operation_type.as_str(),
            operation.id,
            operation.entity_id
        );

        let now = Utc::now();
        self.db
            .execute(
                r#"
                INSERT INTO sync_queue (
                    id, user_id, session_id, operation_type, entity_type, entity_id,
                    payload, version, op_timestamp, retry_count, last_error,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10, ?10)
                "#,
                params![
                    operation.id.to_string(),
                    operation.user_id,
                    operation.session_id,
                    operation.operation_type.as_str(),
                    operation.entity_type,
                    operation.entity_id,
                    operation.payload.to_wire(),
                    operation.version,
                    operation.timestamp.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        Ok(QueuedOperation {
            operation: operation.clone(),
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// All records still eligible for automatic retry, oldest first
    pub fn get_pending(&self) -> Result<Vec<QueuedOperation>, QueueError> {
        let sql = format!(
            "{} WHERE user_id = ?1 AND retry_count < ?2 ORDER BY created_at ASC, rowid ASC",
            SELECT_COLUMNS
        );
        let items = self.fetch(&sql, params![self.user_id, self.policy.max_retries])?;
        log::debug!("Found {} pending queue items", items.len());
        Ok(items)
    }

    /// Pending records whose backoff window has elapsed at `now`
    pub fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<QueuedOperation>, QueueError> {
        Ok(self
            .get_pending()?
            .into_iter()
            .filter(|item| now >= item.next_attempt_at(&self.policy))
            .collect())
    }

    /// Records that reached the retry ceiling
    pub fn get_failed(&self) -> Result<Vec<QueuedOperation>, QueueError> {
        let sql = format!(
            "{} WHERE user_id = ?1 AND retry_count >= ?2 ORDER BY created_at ASC, rowid ASC",
            SELECT_COLUMNS
        );
        self.fetch(&sql, params![self.user_id, self.policy.max_retries])
    }

    /// Get queue record by operation id
    pub fn get(&self, id: Uuid) -> Result<QueuedOperation, QueueError> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        self.fetch(&sql, params![id.to_string()])?
            .into_iter()
            .next()
            .ok_or(QueueError::ItemNotFound(id))
    }

    /// Record a failed attempt: bump retry count, refresh `updated_at`, keep the error
    pub fn mark_failed(&self, id: Uuid, error: &str) -> Result<QueuedOperation, QueueError> {
        log::warn!("Queue item {} failed: {}", id, error);

        let affected = self
            .db
            .execute(
                r#"
                UPDATE sync_queue
                SET retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
                WHERE id = ?3
                "#,
                params![error, Utc::now().to_rfc3339(), id.to_string()],
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::ItemNotFound(id));
        }

        let item = self.get(id)?;
        if item.is_permanently_failed(&self.policy) {
            log::warn!("Queue item {} exceeded max retries", id);
        } else {
            log::info!(
                "Queue item {} will retry at {} (attempt {}/{})",
                id,
                item.next_attempt_at(&self.policy),
                item.retry_count + 1,
                self.policy.max_retries
            );
        }
        Ok(item)
    }

    /// Retire a record immediately (errors that retrying cannot fix)
    pub fn mark_permanently_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        log::warn!("Queue item {} permanently failed: {}", id, error);

        let affected = self
            .db
            .execute(
                r#"
                UPDATE sync_queue
                SET retry_count = MAX(retry_count, ?1), last_error = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
                params![
                    self.policy.max_retries,
                    error,
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::ItemNotFound(id));
        }
        Ok(())
    }

    /// Delete a confirmed operation
    pub fn remove(&self, id: Uuid) -> Result<(), QueueError> {
        self.db
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id.to_string()])
            .map_err(|e| QueueError::Database(e.to_string()))?;

        log::debug!("Deleted queue item {}", id);
        Ok(())
    }

    /// Delete every record for this user
    pub fn clear(&self) -> Result<usize, QueueError> {
        let deleted = self
            .db
            .execute("DELETE FROM sync_queue WHERE user_id = ?1", params![self.user_id])
            .map_err(|e| QueueError::Database(e.to_string()))?;

        log::info!("Cleared {} queue items", deleted);
        Ok(deleted)
    }

    /// Reset permanently failed records for manual retry
    pub fn retry_failed(&self) -> Result<usize, QueueError> {
        let updated = self
            .db
            .execute(
                r#"
                UPDATE sync_queue
                SET retry_count = 0, last_error = NULL, updated_at = ?1
                WHERE user_id = ?2 AND retry_count >= ?3
                "#,
                params![Utc::now().to_rfc3339(), self.user_id, self.policy.max_retries],
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        log::info!("Reset {} failed items for retry", updated);
        Ok(updated)
    }

    /// Discard all permanently failed records (manual action)
    pub fn clear_failed(&self) -> Result<usize, QueueError> {
        let deleted = self
            .db
            .execute(
                "DELETE FROM sync_queue WHERE user_id = ?1 AND retry_count >= ?2",
                params![self.user_id, self.policy.max_retries],
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        log::info!("Cleared {} permanently failed queue items", deleted);
        Ok(deleted)
    }

    /// Get queue statistics
    pub fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let now = Utc::now();
        let pending = self.get_pending()?;
        let failed_count: i64 = self
            .db
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE user_id = ?1 AND retry_count >= ?2",
                params![self.user_id, self.policy.max_retries],
                |row| row.get(0),
            )
            .map_err(|e| QueueError::Database(e.to_string()))?;

        let retryable_count = pending
            .iter()
            .filter(|item| now >= item.next_attempt_at(&self.policy))
            .count();
        let failed_count = failed_count.max(0) as usize;

        Ok(QueueStats {
            pending_count: pending.len(),
            retryable_count,
            failed_count,
            total_count: pending.len() + failed_count,
            oldest_pending_at: pending.first().map(|item| item.created_at),
        })
    }

    fn fetch<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<QueuedOperation>, QueueError> {
        let rows = self
            .db
            .query(sql, params, |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    session_id: row.get(2)?,
                    operation_type: row.get(3)?,
                    entity_type: row.get(4)?,
                    entity_id: row.get(5)?,
                    payload: row.get(6)?,
                    version: row.get(7)?,
                    op_timestamp: row.get(8)?,
                    retry_count: row.get(9)?,
                    last_error: row.get(10)?,
                    created_at: row.get(11)?,
                    updated_at: row.get(12)?,
                })
            })
            .map_err(|e| QueueError::Database(e.to_string()))?;

        rows.into_iter().map(RawRow::into_queued).collect()
    }
}

/// Column values as stored, before validation
struct RawRow {
    id: String,
    user_id: String,
    session_id: String,
    operation_type: String,
    entity_type: String,
    entity_id: String,
    payload: String,
    version: i64,
    op_timestamp: String,
    retry_count: u32,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn into_queued(self) -> Result<QueuedOperation, QueueError> {
        let corrupt = |what: &str, detail: String| {
            QueueError::Serialization(format!("queue row {}: bad {}: {}", self.id, what, detail))
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt("id", e.to_string()))?;
        let operation_type = OperationType::parse(&self.operation_type)
            .map_err(|e| corrupt("operation_type", e.to_string()))?;
        let payload =
            Payload::from_wire(&self.payload).map_err(|e| corrupt("payload", e.to_string()))?;

        Ok(QueuedOperation {
            operation: SyncOperation {
                id,
                user_id: self.user_id.clone(),
                session_id: self.session_id.clone(),
                operation_type,
                entity_type: self.entity_type.clone(),
                entity_id: self.entity_id.clone(),
                payload,
                version: self.version,
                timestamp: parse_timestamp(&self.op_timestamp)
                    .map_err(|e| corrupt("op_timestamp", e))?,
            },
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            created_at: parse_timestamp(&self.created_at).map_err(|e| corrupt("created_at", e))?,
            updated_at: parse_timestamp(&self.updated_at).map_err(|e| corrupt("updated_at", e))?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("Corrupt queue record: {0}")]
    Serialization(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::crypto::{seal, SyncKey};

    fn create_test_queue() -> OfflineQueue {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        OfflineQueue::new(db, "user-1", RetryPolicy::default())
    }

    fn operation(entity_id: &str) -> SyncOperation {
        let key = SyncKey::from_bytes([4u8; 32]);
        SyncOperation {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            session_id: "session-a".to_string(),
            operation_type: OperationType::Update,
            entity_type: "task".to_string(),
            entity_id: entity_id.to_string(),
            payload: Payload::Sealed(seal(b"{\"done\":true}", &key).unwrap()),
            version: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_queue_creation() {
        let queue = create_test_queue();
        let stats = queue.get_stats().unwrap();
        assert_eq!(stats, QueueStats::default());
    }

    #[test]
    fn test_enqueue_roundtrip() {
        let queue = create_test_queue();
        let op = operation("task-1");

        queue.enqueue(&op).unwrap();

        let stored = queue.get(op.id).unwrap();
        assert_eq!(stored.operation, op);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_error.is_none());

        let stats = queue.get_stats().unwrap();
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.retryable_count, 1);
    }

    #[test]
    fn test_pending_ordered_by_creation() {
        let queue = create_test_queue();
        let ops: Vec<_> = (0..3).map(|i| operation(&format!("task-{}", i))).collect();
        for op in &ops {
            queue.enqueue(op).unwrap();
        }

        let ids: Vec<_> = queue.get_pending().unwrap().into_iter().map(|q| q.operation.id).collect();
        assert_eq!(ids, ops.iter().map(|o| o.id).collect::<Vec<_>>());
    }

    #[test]
    fn test_mark_failed_and_backoff() {
        let queue = create_test_queue();
        let op = operation("task-1");
        queue.enqueue(&op).unwrap();

        let updated = queue.mark_failed(op.id, "Network error").unwrap();
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("Network error"));
        assert!(updated.updated_at >= updated.created_at);

        // Inside the backoff window it is pending but not retryable
        assert_eq!(queue.get_pending().unwrap().len(), 1);
        assert!(queue.get_retryable(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + Duration::seconds(5);
        assert_eq!(queue.get_retryable(later).unwrap().len(), 1);
    }

    #[test]
    fn test_max_retries() {
        let queue = create_test_queue();
        let op = operation("task-1");
        queue.enqueue(&op).unwrap();

        for _ in 0..5 {
            queue.mark_failed(op.id, "Error").unwrap();
        }

        let updated = queue.get(op.id).unwrap();
        assert_eq!(updated.retry_count, 5);

        assert!(queue.get_pending().unwrap().is_empty());
        let far_future = Utc::now() + Duration::days(30);
        assert!(queue.get_retryable(far_future).unwrap().is_empty());

        let failed = queue.get_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation.id, op.id);

        let stats = queue.get_stats().unwrap();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.pending_count, 0);
    }

    #[test]
    fn test_mark_permanently_failed() {
        let queue = create_test_queue();
        let op = operation("task-1");
        queue.enqueue(&op).unwrap();

        queue.mark_permanently_failed(op.id, "unauthorized").unwrap();

        assert!(queue.get_pending().unwrap().is_empty());
        let failed = queue.get_failed().unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("unauthorized"));
    }

    #[test]
    fn test_retry_failed_items() {
        let queue = create_test_queue();
        let op = operation("task-1");
        queue.enqueue(&op).unwrap();
        queue.mark_permanently_failed(op.id, "Error").unwrap();

        assert_eq!(queue.retry_failed().unwrap(), 1);

        let updated = queue.get(op.id).unwrap();
        assert_eq!(updated.retry_count, 0);
        assert!(updated.last_error.is_none());
        assert_eq!(queue.get_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_failed_keeps_pending() {
        let queue = create_test_queue();
        let keep = operation("task-1");
        let drop_me = operation("task-2");
        queue.enqueue(&keep).unwrap();
        queue.enqueue(&drop_me).unwrap();
        queue.mark_permanently_failed(drop_me.id, "Error").unwrap();

        assert_eq!(queue.clear_failed().unwrap(), 1);
        assert!(queue.get(keep.id).is_ok());
        assert_eq!(queue.get(drop_me.id), Err(QueueError::ItemNotFound(drop_me.id)));
    }

    #[test]
    fn test_remove_and_clear() {
        let queue = create_test_queue();
        let a = operation("task-1");
        let b = operation("task-2");
        queue.enqueue(&a).unwrap();
        queue.enqueue(&b).unwrap();

        queue.remove(a.id).unwrap();
        assert_eq!(queue.get_pending().unwrap().len(), 1);

        assert_eq!(queue.clear().unwrap(), 1);
        assert_eq!(queue.get_stats().unwrap().total_count, 0);
    }

    #[test]
    fn test_mark_failed_unknown_id() {
        let queue = create_test_queue();
        let missing = Uuid::new_v4();
        assert_eq!(
            queue.mark_failed(missing, "x").unwrap_err(),
            QueueError::ItemNotFound(missing)
        );
    }

    #[test]
    fn test_queues_are_scoped_per_user() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mine = OfflineQueue::new(db.clone(), "user-1", RetryPolicy::default());
        let theirs = OfflineQueue::new(db, "user-2", RetryPolicy::default());

        mine.enqueue(&operation("task-1")).unwrap();
        assert_eq!(mine.get_pending().unwrap().len(), 1);
        assert!(theirs.get_pending().unwrap().is_empty());
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let op = operation("task-1");

        {
            let db = Arc::new(Database::new(path.clone()).unwrap());
            let queue = OfflineQueue::new(db, "user-1", RetryPolicy::default());
            queue.enqueue(&op).unwrap();
            queue.mark_failed(op.id, "offline").unwrap();
            // process exits before remove()
        }

        let db = Arc::new(Database::new(path).unwrap());
        let queue = OfflineQueue::new(db, "user-1", RetryPolicy::default());
        let pending = queue.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, op);
        assert_eq!(pending[0].retry_count, 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(
            5,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(10),
        );

        assert_eq!(policy.delay(0), Duration::seconds(1));
        assert_eq!(policy.delay(1), Duration::seconds(2));
        assert_eq!(policy.delay(3), Duration::seconds(8));
        assert_eq!(policy.delay(4), Duration::seconds(10));
        assert_eq!(policy.delay(200), Duration::seconds(10));
    }
}
