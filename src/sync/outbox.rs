//! Outbox - bounded in-memory operation queue
//!
//! Holds operations waiting to be pushed. The durable offline queue is the
//! source of truth; this is its working copy, owned by the orchestrator.
//!
//! - FIFO with a hard capacity (fails fast with `QueueFull`)
//! - One batch in flight at a time (`begin_batch` is a no-op while processing)
//! - Failed operations go to the back with exponential backoff
//! - Exhausted or terminal operations move to the permanently-failed list

use super::models::SyncOperation;
use super::queue::{QueueError, RetryPolicy};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use uuid::Uuid;

/// Operation waiting in the outbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub operation: SyncOperation,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PendingOperation {
    pub fn new(operation: SyncOperation, now: DateTime<Utc>) -> Self {
        Self {
            operation,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at <= now
    }
}

/// Operation excluded from automatic retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
    pub operation: SyncOperation,
    pub retry_count: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// What happened to an operation after a failed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    Exhausted(FailedOperation),
}

pub struct OperationQueue {
    entries: VecDeque<PendingOperation>,
    failed: Vec<FailedOperation>,
    capacity: usize,
    policy: RetryPolicy,
    processing: bool,
    /// Entries handed out by `begin_batch` and not yet settled
    in_flight: usize,
}

impl OperationQueue {
    pub fn new(capacity: usize, policy: RetryPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            failed: Vec::new(),
            capacity,
            policy,
            processing: false,
            in_flight: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of operations awaiting transmission (excludes in-flight and failed)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Operations handed out in the current batch
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Capacity covers waiting entries and the batch in flight
    pub fn is_full(&self) -> bool {
        self.entries.len() + self.in_flight >= self.capacity
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.iter().any(|e| e.operation.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOperation> {
        self.entries.iter()
    }

    /// True when at least one operation is due at `now`
    pub fn has_ready(&self, now: DateTime<Utc>) -> bool {
        self.entries.iter().any(|e| e.is_ready(now))
    }

    /// Append a new operation
    pub fn enqueue(&mut self, operation: SyncOperation) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(PendingOperation::new(operation, Utc::now()));
        Ok(())
    }

    /// Seed a recovered entry; recovery never drops work, so capacity is not enforced
    pub fn restore(&mut self, entry: PendingOperation) {
        if self.is_full() {
            log::warn!(
                "Outbox over capacity while restoring operation {} ({} entries)",
                entry.operation.id,
                self.entries.len()
            );
        }
        self.entries.push_back(entry);
    }

    pub fn restore_failed(&mut self, failed: FailedOperation) {
        self.failed.push(failed);
    }

    /// Take up to `limit` due operations, in FIFO order
    ///
    /// Returns `None` while another batch is in flight.
    pub fn begin_batch(&mut self, limit: usize, now: DateTime<Utc>) -> Option<Vec<PendingOperation>> {
        if self.processing {
            return None;
        }
        self.processing = true;

        let mut batch = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            if batch.len() < limit && entry.is_ready(now) {
                batch.push(entry);
            } else {
                waiting.push_back(entry);
            }
        }
        self.entries = waiting;
        self.in_flight = batch.len();

        Some(batch)
    }

    /// Settle the batch; entries not returned through `record_failure`,
    /// `record_terminal` or `requeue` count as delivered
    pub fn finish_batch(&mut self) {
        self.processing = false;
        self.in_flight = 0;
    }

    /// Put untried operations back at the front, preserving their order
    pub fn requeue(&mut self, entries: Vec<PendingOperation>) {
        self.in_flight = self.in_flight.saturating_sub(entries.len());
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Record a failed send; reschedules at the back or retires the operation
    pub fn record_failure(
        &mut self,
        mut entry: PendingOperation,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let error = error.into();
        self.in_flight = self.in_flight.saturating_sub(1);
        entry.retry_count += 1;

        if entry.retry_count >= self.policy.max_retries {
            let failed = FailedOperation {
                operation: entry.operation,
                retry_count: entry.retry_count,
                error,
                failed_at: now,
            };
            self.failed.push(failed.clone());
            return FailureOutcome::Exhausted(failed);
        }

        entry.next_retry_at = now + self.policy.delay(entry.retry_count);
        entry.last_error = Some(error);
        let outcome = FailureOutcome::Rescheduled {
            retry_count: entry.retry_count,
            next_retry_at: entry.next_retry_at,
        };
        self.entries.push_back(entry);
        outcome
    }

    /// Retire an operation that cannot succeed by retrying (e.g. rejected credentials)
    pub fn record_terminal(
        &mut self,
        entry: PendingOperation,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailedOperation {
        self.in_flight = self.in_flight.saturating_sub(1);
        let failed = FailedOperation {
            operation: entry.operation,
            retry_count: entry.retry_count,
            error: error.into(),
            failed_at: now,
        };
        self.failed.push(failed.clone());
        failed
    }

    pub fn permanently_failed(&self) -> &[FailedOperation] {
        &self.failed
    }

    /// Remove and return every permanently-failed operation
    pub fn take_failed(&mut self) -> Vec<FailedOperation> {
        std::mem::take(&mut self.failed)
    }

    /// Drop all active and failed entries
    pub fn clear(&mut self) {
        self.entries.clear();
        self.failed.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::crypto::Payload;
    use crate::sync::models::OperationType;
    use chrono::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, std::time::Duration::from_secs(1), std::time::Duration::from_secs(3600))
    }

    fn op(entity: &str) -> SyncOperation {
        SyncOperation {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            session_id: "session-a".to_string(),
            operation_type: OperationType::Delete,
            entity_type: "note".to_string(),
            entity_id: entity.to_string(),
            payload: Payload::Tombstone,
            version: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_capacity_enforced() {
        let mut queue = OperationQueue::new(1000, policy());

        for i in 0..1000 {
            queue.enqueue(op(&format!("e{}", i))).unwrap();
        }
        assert_eq!(queue.len(), 1000);

        let result = queue.enqueue(op("overflow"));
        assert_eq!(result, Err(QueueError::QueueFull { capacity: 1000 }));
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_batch_in_flight_counts_toward_capacity() {
        let mut queue = OperationQueue::new(3, policy());
        for i in 0..3 {
            queue.enqueue(op(&format!("e{}", i))).unwrap();
        }

        let now = Utc::now();
        let mut batch = queue.begin_batch(2, now).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 2);
        assert!(queue.is_full());
        assert_eq!(
            queue.enqueue(op("late")),
            Err(QueueError::QueueFull { capacity: 3 })
        );

        // A rescheduled entry moves from in flight back to waiting
        queue.record_failure(batch.remove(0), "timeout", now);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.in_flight(), 1);
        assert!(queue.is_full());

        // The other entry was delivered
        queue.finish_batch();
        assert_eq!(queue.in_flight(), 0);
        assert!(!queue.is_full());
        queue.enqueue(op("late")).unwrap();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_batch_is_fifo_and_limited() {
        let mut queue = OperationQueue::new(10, policy());
        let ops: Vec<_> = (0..5).map(|i| op(&format!("e{}", i))).collect();
        for o in &ops {
            queue.enqueue(o.clone()).unwrap();
        }

        let batch = queue.begin_batch(3, Utc::now()).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.operation.id).collect();
        assert_eq!(ids, vec![ops[0].id, ops[1].id, ops[2].id]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reentrant_batch_is_noop() {
        let mut queue = OperationQueue::new(10, policy());
        queue.enqueue(op("a")).unwrap();

        assert!(queue.begin_batch(10, Utc::now()).is_some());
        assert!(queue.is_processing());
        assert!(queue.begin_batch(10, Utc::now()).is_none());

        queue.finish_batch();
        assert!(queue.begin_batch(10, Utc::now()).is_some());
    }

    #[test]
    fn test_failure_moves_to_back_with_backoff() {
        let mut queue = OperationQueue::new(10, policy());
        let first = op("a");
        let second = op("b");
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        let now = Utc::now();
        let mut batch = queue.begin_batch(1, now).unwrap();
        let outcome = queue.record_failure(batch.remove(0), "timeout", now);
        queue.finish_batch();

        assert_eq!(
            outcome,
            FailureOutcome::Rescheduled {
                retry_count: 1,
                next_retry_at: now + Duration::seconds(2),
            }
        );

        let order: Vec<_> = queue.pending().map(|e| e.operation.id).collect();
        assert_eq!(order, vec![second.id, first.id]);

        // Not yet due: only the healthy operation is handed out
        let batch = queue.begin_batch(10, now).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operation.id, second.id);
    }

    #[test]
    fn test_five_failures_retire_operation() {
        let mut queue = OperationQueue::new(10, policy());
        let operation = op("a");
        queue.enqueue(operation.clone()).unwrap();

        let mut now = Utc::now();
        let mut last = None;
        for _ in 0..5 {
            let mut batch = queue.begin_batch(10, now).unwrap();
            assert_eq!(batch.len(), 1);
            last = Some(queue.record_failure(batch.remove(0), "503", now));
            queue.finish_batch();
            now = now + Duration::hours(2);
        }

        assert!(matches!(last, Some(FailureOutcome::Exhausted(_))));
        assert!(!queue.contains(operation.id));
        assert!(queue.is_empty());
        assert_eq!(queue.permanently_failed().len(), 1);
        assert_eq!(queue.permanently_failed()[0].operation.id, operation.id);
        assert_eq!(queue.permanently_failed()[0].retry_count, 5);
    }

    #[test]
    fn test_terminal_failure_skips_retries() {
        let mut queue = OperationQueue::new(10, policy());
        queue.enqueue(op("a")).unwrap();

        let mut batch = queue.begin_batch(10, Utc::now()).unwrap();
        let failed = queue.record_terminal(batch.remove(0), "unauthorized", Utc::now());

        assert_eq!(failed.retry_count, 0);
        assert!(queue.is_empty());
        assert_eq!(queue.permanently_failed().len(), 1);
        assert_eq!(queue.take_failed().len(), 1);
        assert!(queue.permanently_failed().is_empty());
    }

    #[test]
    fn test_requeue_preserves_order_at_front() {
        let mut queue = OperationQueue::new(10, policy());
        let ops: Vec<_> = (0..3).map(|i| op(&format!("e{}", i))).collect();
        for o in &ops {
            queue.enqueue(o.clone()).unwrap();
        }

        let batch = queue.begin_batch(2, Utc::now()).unwrap();
        queue.requeue(batch);
        queue.finish_batch();

        let order: Vec<_> = queue.pending().map(|e| e.operation.id).collect();
        assert_eq!(order, ops.iter().map(|o| o.id).collect::<Vec<_>>());
    }

    #[test]
    fn test_restore_ignores_capacity() {
        let mut queue = OperationQueue::new(1, policy());
        queue.enqueue(op("a")).unwrap();
        queue.restore(PendingOperation::new(op("b"), Utc::now()));
        assert_eq!(queue.len(), 2);
        assert!(queue.enqueue(op("c")).is_err());
    }
}
