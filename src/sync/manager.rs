//! Sync Service - Orchestrates the offline-first sync cycle
//!
//! Coordinates the durable queue, the in-memory outbox, the conflict register
//! and the repository. Handles:
//! - Sealing local mutations and queueing them (durable first)
//! - Pull-then-push cycles, at most one in flight
//! - Retry with backoff, permanent failure after the retry ceiling
//! - Live feed from the repository
//! - Startup recovery from the durable queue
//! - Teardown (`destroy`)

use super::crypto::{open, seal, CryptoError, KeyProvider, Payload, SyncKey};
use super::events::{CycleReport, EventBus, SyncEvent};
use super::lww::LwwElementSet;
use super::models::{
    DraftBody, DraftKind, EntityRecord, OperationDraft, OperationType, SessionIdentity,
    SyncConfig, SyncOperation, SyncState, SyncStatus, WireOperation,
};
use super::outbox::{FailedOperation, FailureOutcome, OperationQueue, PendingOperation};
use super::queue::{OfflineQueue, QueueError, QueueStats, RetryPolicy};
use super::repository::{ChangeCallback, PushResult, Repository, RepositoryError, Subscription};
use super::scheduler::{BackgroundScheduler, ScheduledTask};
use super::store::{EntityStore, StoredEntry};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of a `sync_now` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was in flight; it picks up this trigger's work
    AlreadySyncing,
    Offline,
    /// `start` has not finished recovering persisted state
    NotStarted,
    Destroyed,
}

/// State owned by the service, never locked across an await
struct LocalState {
    outbox: OperationQueue,
    register: LwwElementSet<EntityRecord>,
    /// Highest version seen per entity (local or remote)
    versions: HashMap<String, i64>,
    last_sync_version: i64,
    last_sync_time: Option<DateTime<Utc>>,
    sync_errors: u64,
    last_cycle_failed: bool,
}

struct Inner {
    identity: SessionIdentity,
    config: SyncConfig,
    repository: Arc<dyn Repository>,
    key_provider: Arc<dyn KeyProvider>,
    db: Arc<Database>,
    durable: Arc<OfflineQueue>,
    store: Arc<EntityStore>,
    events: EventBus,
    state: StdMutex<LocalState>,
    syncing: AtomicBool,
    online: AtomicBool,
    started: AtomicBool,
    /// Set once persisted state has been recovered
    ready: AtomicBool,
    destroyed: AtomicBool,
    /// Runtime captured by `start`; triggers spawn onto it from any thread
    runtime: OnceLock<Handle>,
    scheduler: BackgroundScheduler,
    subscription: StdMutex<Option<Subscription>>,
    realtime_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Sync service - main orchestrator
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

/// Clears the syncing flag when a cycle ends, however it ends
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A failed push, after the outbox has rescheduled or retired it
struct FailureRecord {
    operation: SyncOperation,
    error: String,
    retry_count: u32,
    permanent: bool,
}

impl SyncService {
    /// Create a service using the configuration persisted in `db`
    pub fn new(
        identity: SessionIdentity,
        repository: Arc<dyn Repository>,
        key_provider: Arc<dyn KeyProvider>,
        db: Arc<Database>,
    ) -> Result<Self, SyncError> {
        let config = SyncConfig::load(&db)?;
        Self::with_config(config, identity, repository, key_provider, db)
    }

    pub fn with_config(
        config: SyncConfig,
        identity: SessionIdentity,
        repository: Arc<dyn Repository>,
        key_provider: Arc<dyn KeyProvider>,
        db: Arc<Database>,
    ) -> Result<Self, SyncError> {
        config.validate().map_err(SyncError::InvalidConfig)?;

        let policy = RetryPolicy::new(config.max_retries, config.backoff_base(), config.backoff_max());
        let durable = Arc::new(OfflineQueue::new(db.clone(), identity.user_id.clone(), policy));
        let store = Arc::new(EntityStore::new(db.clone(), identity.user_id.clone()));

        let state = LocalState {
            outbox: OperationQueue::new(config.queue_capacity, policy),
            register: LwwElementSet::new(),
            versions: HashMap::new(),
            last_sync_version: 0,
            last_sync_time: None,
            sync_errors: 0,
            last_cycle_failed: false,
        };

        log::info!(
            "Sync service created for user {} (session {}, device {})",
            identity.user_id,
            identity.session_id,
            identity.device_name
        );

        Ok(Self {
            inner: Arc::new(Inner {
                scheduler: BackgroundScheduler::new(config.retry_interval()),
                identity,
                config,
                repository,
                key_provider,
                db,
                durable,
                store,
                events: EventBus::default(),
                state: StdMutex::new(state),
                syncing: AtomicBool::new(false),
                online: AtomicBool::new(true),
                started: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                runtime: OnceLock::new(),
                subscription: StdMutex::new(None),
                realtime_task: StdMutex::new(None),
            }),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Restore entity state, recover queued work, load the cursor, attach the
    /// live feed and the retry scheduler, then run the first cycle
    ///
    /// Mutations and cycles are refused with `NotStarted` until recovery is done.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.ensure_alive()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            log::debug!("Sync service already started");
            return Ok(());
        }
        // Already set only if an earlier start failed; same runtime either way
        let _ = self.inner.runtime.set(Handle::current());

        if let Err(e) = self.bootstrap().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.inner.ready.store(true, Ordering::SeqCst);

        self.subscribe_realtime().await;

        let tick = Arc::new(RetryTick {
            service: Arc::downgrade(&self.inner),
        });
        self.inner
            .scheduler
            .start(tick)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        log::info!("Sync service started for user {}", self.inner.identity.user_id);
        self.emit_status();

        if self.inner.config.sync_on_startup {
            self.trigger();
        }
        Ok(())
    }

    /// Tear down: unsubscribe, stop the scheduler, make future triggers no-ops
    ///
    /// A cycle already in flight finishes its durable bookkeeping but emits
    /// nothing.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.inner.scheduler.is_running() {
            if let Err(e) = self.inner.scheduler.stop() {
                log::debug!("Scheduler stop during destroy: {}", e);
            }
        }
        let subscription = lock(&self.inner.subscription).take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        let task = lock(&self.inner.realtime_task).take();
        if let Some(task) = task {
            task.abort();
        }

        log::info!("Sync service destroyed for user {}", self.inner.identity.user_id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// True once `start` has recovered persisted state
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    /// Seal, persist and queue a local mutation
    ///
    /// The operation is durably stored before this returns `Ok`.
    pub async fn enqueue_operation(&self, draft: OperationDraft) -> Result<SyncOperation, SyncError> {
        self.ensure_ready()?;

        let operation_type = draft.operation_type();
        let (payload, plaintext) = self.seal_draft(draft.kind)?;

        let operation = {
            let mut state = self.state();
            if state.outbox.is_full() {
                return Err(SyncError::QueueFull {
                    capacity: state.outbox.capacity(),
                });
            }
            let version = state.versions.get(&draft.entity_id).copied().unwrap_or(0) + 1;
            state.versions.insert(draft.entity_id.clone(), version);

            SyncOperation {
                id: Uuid::new_v4(),
                user_id: self.inner.identity.user_id.clone(),
                session_id: self.inner.identity.session_id.clone(),
                operation_type,
                entity_type: draft.entity_type,
                entity_id: draft.entity_id,
                payload,
                version,
                timestamp: Utc::now(),
            }
        };

        let durable = self.inner.durable.clone();
        let record = operation.clone();
        blocking(move || durable.enqueue(&record)).await?;

        let queued = {
            let mut guard = self.state();
            let state = &mut *guard;
            let result = state.outbox.enqueue(operation.clone());
            if result.is_ok() {
                apply_to_register(&mut state.register, &operation, plaintext);
            }
            result
        };

        if let Err(e) = queued {
            // Lost a capacity race after the durable write
            let durable = self.inner.durable.clone();
            let id = operation.id;
            if let Err(rollback) = blocking(move || durable.remove(id)).await {
                log::error!("Failed to roll back queue item {}: {}", id, rollback);
            }
            return Err(e.into());
        }

        self.persist_entity(&operation).await;

        log::info!(
            "Queued {} {} for {} {} (version {})",
            operation.operation_type.as_str(),
            operation.id,
            operation.entity_type,
            operation.entity_id,
            operation.version
        );

        self.emit(SyncEvent::OperationQueued {
            operation_id: operation.id,
            operation_type: operation.operation_type,
            entity_type: operation.entity_type.clone(),
            entity_id: operation.entity_id.clone(),
        });
        self.emit_status();

        if self.inner.config.sync_on_enqueue {
            self.trigger();
        }
        Ok(operation)
    }

    fn seal_draft(&self, kind: DraftKind) -> Result<(Payload, Option<Vec<u8>>), SyncError> {
        match kind {
            DraftKind::Delete => Ok((Payload::Tombstone, None)),
            DraftKind::Create(body) | DraftKind::Update(body) => {
                let key = self.key()?;
                match body {
                    DraftBody::Plain(data) => {
                        let envelope = seal(&data, &key)?;
                        Ok((Payload::Sealed(envelope), Some(data)))
                    }
                    // Must open under the session key, or peers could not read it either
                    DraftBody::Sealed(envelope) => {
                        let data = open(&envelope, &key)?;
                        Ok((Payload::Sealed(envelope), Some(data)))
                    }
                }
            }
        }
    }

    // ========================================================================
    // Connectivity & triggers
    // ========================================================================

    /// Going offline suspends automatic cycles; coming online triggers one
    pub fn set_online(&self, online: bool) {
        if self.inner.online.swap(online, Ordering::SeqCst) == online {
            return;
        }

        log::info!(
            "Network {} for user {}",
            if online { "online" } else { "offline" },
            self.inner.identity.user_id
        );
        self.emit_status();

        if online {
            self.trigger();
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Spawn a cycle unless one is running or we cannot sync
    ///
    /// Safe to call from threads outside the runtime.
    fn trigger(&self) {
        if self.is_destroyed() || !self.is_ready() || !self.is_online() || self.is_syncing() {
            return;
        }
        let Some(runtime) = self.inner.runtime.get() else {
            return;
        };
        let service = self.clone();
        runtime.spawn(async move {
            service.sync_now().await;
        });
    }

    // ========================================================================
    // Sync cycle
    // ========================================================================

    /// Run one pull-then-push cycle now
    ///
    /// A no-op when a cycle is already in flight, when offline, before
    /// `start` has finished, or after `destroy`.
    pub async fn sync_now(&self) -> CycleOutcome {
        if self.is_destroyed() {
            return CycleOutcome::Destroyed;
        }
        if !self.is_ready() {
            log::debug!("Sync service not started, skipping sync cycle");
            return CycleOutcome::NotStarted;
        }
        if !self.is_online() {
            log::debug!("Offline, skipping sync cycle");
            return CycleOutcome::Offline;
        }
        let Some(guard) = CycleGuard::acquire(&self.inner.syncing) else {
            log::debug!("Sync already in progress, coalescing trigger");
            return CycleOutcome::AlreadySyncing;
        };

        log::info!("Starting sync cycle for user {}", self.inner.identity.user_id);
        self.emit_status();

        let report = self.run_cycle().await;
        drop(guard);

        log::info!(
            "Sync cycle complete: pulled={}, applied={}, skipped={}, pushed={}, failed={}, version={}",
            report.pulled,
            report.applied,
            report.skipped,
            report.pushed,
            report.failed,
            report.last_sync_version
        );

        self.emit_status();
        self.emit(SyncEvent::SyncComplete(report.clone()));
        CycleOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        // Pull first so local conflict resolution sees the latest remote state
        let pulled = self.pull(&mut report).await;
        let pull_failed = pulled.is_err();
        match pulled {
            Ok(()) => {
                let cursor = {
                    let mut state = self.state();
                    state.last_sync_time = Some(Utc::now());
                    state.last_sync_version
                };
                self.persist_cursor(cursor, SyncState::Idle).await;
            }
            Err(e) => {
                log::warn!("Pull failed: {}", e);
                let cursor = {
                    let mut state = self.state();
                    state.sync_errors += 1;
                    state.last_sync_version
                };
                self.persist_cursor(cursor, SyncState::Error).await;
            }
        }

        while self.is_online() && !self.is_destroyed() {
            if !self.push_batch(&mut report).await {
                break;
            }
            if !self.state().outbox.has_ready(Utc::now()) {
                break;
            }
        }

        {
            let mut state = self.state();
            state.last_cycle_failed = pull_failed || report.failed > 0;
            report.last_sync_version = state.last_sync_version;
        }
        report
    }

    async fn pull(&self, report: &mut CycleReport) -> Result<(), RepositoryError> {
        let user_id = self.inner.identity.user_id.clone();
        let page_size = self.inner.config.pull_page_size;
        let start = self.state().last_sync_version;
        let mut since = start;

        while !self.is_destroyed() {
            let page = self
                .call(self.inner.repository.pull_changes(&user_id, since, page_size))
                .await?;
            let received = page.len();

            let mut newest = since;
            for wire in page {
                newest = newest.max(wire.version);
                report.pulled += 1;
                if self.apply_remote(wire).await {
                    report.applied += 1;
                } else {
                    report.skipped += 1;
                }
            }

            let advanced = newest > since;
            if advanced {
                since = newest;
                self.advance_cursor(since).await;
            }
            if !advanced || received < page_size {
                break;
            }
        }

        if since > start {
            if let Err(e) = self
                .call(self.inner.repository.upsert_sync_metadata(&user_id, SyncState::Idle, since))
                .await
            {
                log::warn!("Failed to update remote sync metadata: {}", e);
            }
        }
        Ok(())
    }

    async fn advance_cursor(&self, version: i64) {
        {
            let mut state = self.state();
            state.last_sync_version = state.last_sync_version.max(version);
        }
        self.persist_cursor(version, SyncState::Syncing).await;
    }

    /// Write the local cursor row; the stored version never moves backwards
    async fn persist_cursor(&self, version: i64, status: SyncState) {
        let db = self.inner.db.clone();
        let user_id = self.inner.identity.user_id.clone();
        let persisted = blocking(move || db.upsert_sync_metadata(&user_id, version, status.as_str())).await;
        if let Err(e) = persisted {
            log::error!("Failed to persist sync cursor {}: {}", version, e);
        }
    }

    /// Push one batch; true when it was non-empty and fully confirmed
    async fn push_batch(&self, report: &mut CycleReport) -> bool {
        let batch = {
            let mut state = self.state();
            let Some(batch) = state.outbox.begin_batch(self.inner.config.batch_size, Utc::now()) else {
                return false;
            };
            if batch.is_empty() {
                state.outbox.finish_batch();
                return false;
            }
            batch
        };

        let operations: Vec<SyncOperation> = batch.iter().map(|e| e.operation.clone()).collect();
        log::info!("Pushing {} operations", operations.len());

        let response = self.call(self.inner.repository.push_operations(&operations)).await;
        let terminal = matches!(response, Err(RepositoryError::Unauthorized));

        let mut confirmed = Vec::new();
        let mut rejected: Vec<(PendingOperation, String)> = Vec::new();
        match response {
            Ok(results) => {
                let mut by_id: HashMap<Uuid, PushResult> =
                    results.into_iter().map(|r| (r.operation_id, r)).collect();
                for entry in batch {
                    match by_id.remove(&entry.operation.id) {
                        Some(result) if result.success => confirmed.push(entry),
                        Some(result) => {
                            let error = result.error.unwrap_or_else(|| "rejected by server".to_string());
                            rejected.push((entry, error));
                        }
                        None => rejected.push((entry, "missing from push response".to_string())),
                    }
                }
            }
            Err(e) => {
                if terminal {
                    log::error!("Push rejected credentials, failing batch without retry");
                } else {
                    log::warn!("Push failed: {}", e);
                }
                let error = e.to_string();
                rejected = batch.into_iter().map(|entry| (entry, error.clone())).collect();
            }
        }

        let now = Utc::now();
        let failures: Vec<FailureRecord> = {
            let mut state = self.state();
            let mut failures = Vec::with_capacity(rejected.len());
            for (entry, error) in rejected {
                let operation = entry.operation.clone();
                let (retry_count, permanent) = if terminal {
                    let failed = state.outbox.record_terminal(entry, error.clone(), now);
                    (failed.retry_count, true)
                } else {
                    match state.outbox.record_failure(entry, error.clone(), now) {
                        FailureOutcome::Rescheduled { retry_count, .. } => (retry_count, false),
                        FailureOutcome::Exhausted(failed) => (failed.retry_count, true),
                    }
                };
                failures.push(FailureRecord {
                    operation,
                    error,
                    retry_count,
                    permanent,
                });
            }
            state.sync_errors += failures.len() as u64;
            state.outbox.finish_batch();
            failures
        };

        self.record_push_results(&confirmed, &failures, terminal).await;

        for entry in &confirmed {
            self.emit(SyncEvent::OperationSynced {
                operation_id: entry.operation.id,
                entity_id: entry.operation.entity_id.clone(),
            });
        }
        for failure in &failures {
            if failure.permanent {
                log::warn!(
                    "Operation {} permanently failed after {} attempts: {}",
                    failure.operation.id,
                    failure.retry_count,
                    failure.error
                );
            }
            self.emit(SyncEvent::OperationFailed {
                operation_id: failure.operation.id,
                entity_id: failure.operation.entity_id.clone(),
                error: failure.error.clone(),
                retry_count: failure.retry_count,
                permanent: failure.permanent,
            });
        }

        report.pushed += confirmed.len();
        report.failed += failures.len();
        failures.is_empty()
    }

    /// Mirror push results into the durable queue
    async fn record_push_results(
        &self,
        confirmed: &[PendingOperation],
        failures: &[FailureRecord],
        terminal: bool,
    ) {
        let durable = self.inner.durable.clone();
        let confirmed_ids: Vec<Uuid> = confirmed.iter().map(|e| e.operation.id).collect();
        let failed: Vec<(Uuid, String)> = failures
            .iter()
            .map(|f| (f.operation.id, f.error.clone()))
            .collect();

        let result = blocking(move || {
            for id in confirmed_ids {
                if let Err(e) = durable.remove(id) {
                    log::error!("Failed to remove confirmed queue item {}: {}", id, e);
                }
            }
            for (id, error) in failed {
                let marked = if terminal {
                    durable.mark_permanently_failed(id, &error)
                } else {
                    durable.mark_failed(id, &error).map(|_| ())
                };
                match marked {
                    Ok(()) | Err(QueueError::ItemNotFound(_)) => {}
                    Err(e) => log::error!("Failed to record failure for queue item {}: {}", id, e),
                }
            }
            Ok::<(), QueueError>(())
        })
        .await;

        if let Err(e) = result {
            log::error!("Failed to record push results: {}", e);
        }
    }

    // ========================================================================
    // Remote operations
    // ========================================================================

    /// Validate, decrypt, merge and persist one remote operation; false when
    /// skipped
    async fn apply_remote(&self, wire: WireOperation) -> bool {
        let wire_id = wire.id.clone();
        self.emit(SyncEvent::RemoteOperationReceived {
            operation_id: wire.id.clone(),
            entity_id: wire.entity_id.clone(),
        });

        let operation = match SyncOperation::try_from(wire) {
            Ok(operation) => operation,
            Err(e) => {
                self.skip_remote(wire_id, e.to_string());
                return false;
            }
        };

        if operation.user_id != self.inner.identity.user_id {
            self.skip_remote(wire_id, format!("belongs to user {}", operation.user_id));
            return false;
        }

        let data = match self.key().and_then(|key| plaintext(&operation, &key)) {
            Ok(data) => data,
            Err(e) => {
                self.skip_remote(wire_id, e.to_string());
                return false;
            }
        };

        let changed = {
            let mut guard = self.state();
            let state = &mut *guard;
            let known = state.versions.entry(operation.entity_id.clone()).or_insert(0);
            *known = (*known).max(operation.version);
            apply_to_register(&mut state.register, &operation, data)
        };
        self.persist_entity(&operation).await;

        log::debug!(
            "Applied remote {} {} for {} (version {}, changed: {})",
            operation.operation_type.as_str(),
            operation.id,
            operation.entity_id,
            operation.version,
            changed
        );

        self.emit(SyncEvent::RemoteOperationApplied {
            operation_id: operation.id,
            entity_id: operation.entity_id,
            operation_type: operation.operation_type,
            changed,
        });
        true
    }

    fn skip_remote(&self, operation_id: String, reason: String) {
        log::warn!("Skipping remote operation {}: {}", operation_id, reason);
        self.emit(SyncEvent::RemoteOperationSkipped {
            operation_id,
            reason,
        });
    }

    async fn subscribe_realtime(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WireOperation>();
        let callback: ChangeCallback = Arc::new(move |operation: WireOperation| {
            // Receiver gone means the service was torn down
            let _ = tx.send(operation);
        });

        let user_id = self.inner.identity.user_id.clone();
        match self
            .call(self.inner.repository.subscribe_to_changes(&user_id, callback))
            .await
        {
            Ok(subscription) => *lock(&self.inner.subscription) = Some(subscription),
            Err(e) => {
                log::warn!("Live feed unavailable, relying on pull: {}", e);
                return;
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(operation) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let service = SyncService { inner };
                if service.is_destroyed() {
                    break;
                }
                service.apply_remote(operation).await;
            }
            log::debug!("Live feed task exited");
        });
        *lock(&self.inner.realtime_task) = Some(task);
    }

    // ========================================================================
    // Startup recovery
    // ========================================================================

    async fn bootstrap(&self) -> Result<(), SyncError> {
        let restored = self.restore_entities().await?;
        log::info!("Restored {} stored entity entries", restored);

        let (pending, failed) = self.recover().await?;
        log::info!(
            "Recovered {} pending and {} failed operations from the offline queue",
            pending,
            failed
        );
        self.load_cursor().await
    }

    /// Reload version high-water marks and register entries from the store
    async fn restore_entities(&self) -> Result<usize, SyncError> {
        let store = self.inner.store.clone();
        let (versions, entries) =
            blocking(move || Ok::<_, DbError>((store.versions()?, store.entries()?))).await?;

        let key = if entries.iter().all(StoredEntry::is_remove) {
            None
        } else {
            match self.key() {
                Ok(key) => Some(key),
                Err(e) => {
                    log::warn!("Sync key unavailable, stored entities not restored: {}", e);
                    None
                }
            }
        };

        let mut guard = self.state();
        let state = &mut *guard;

        for (entity_id, version) in versions {
            let known = state.versions.entry(entity_id).or_insert(0);
            *known = (*known).max(version);
        }

        let mut restored = 0;
        for entry in entries {
            if restore_entry(&mut state.register, entry, key.as_ref()) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Write an applied operation through to the entity store
    async fn persist_entity(&self, operation: &SyncOperation) {
        let store = self.inner.store.clone();
        let record = operation.clone();
        if let Err(e) = blocking(move || store.record(&record)).await {
            log::error!(
                "Failed to persist entity state for {} (operation {}): {}",
                operation.entity_id,
                operation.id,
                e
            );
        }
    }

    /// Seed the outbox and register from the durable queue
    async fn recover(&self) -> Result<(usize, usize), SyncError> {
        let durable = self.inner.durable.clone();
        let (pending, failed) =
            blocking(move || Ok::<_, QueueError>((durable.get_pending()?, durable.get_failed()?))).await?;

        let key = if pending.is_empty() && failed.is_empty() {
            None
        } else {
            match self.key() {
                Ok(key) => Some(key),
                Err(e) => {
                    log::warn!("Sync key unavailable during recovery: {}", e);
                    None
                }
            }
        };

        let policy = *self.inner.durable.policy();
        let counts = (pending.len(), failed.len());

        let mut guard = self.state();
        let state = &mut *guard;

        for item in pending {
            if state.outbox.contains(item.operation.id) {
                continue;
            }
            note_version(&mut state.versions, &item.operation);
            let data = key
                .as_ref()
                .and_then(|key| plaintext(&item.operation, key).ok())
                .flatten();
            apply_to_register(&mut state.register, &item.operation, data);

            let next_retry_at = item.next_attempt_at(&policy);
            state.outbox.restore(PendingOperation {
                operation: item.operation,
                retry_count: item.retry_count,
                next_retry_at,
                last_error: item.last_error,
            });
        }

        for item in failed {
            note_version(&mut state.versions, &item.operation);
            let data = key
                .as_ref()
                .and_then(|key| plaintext(&item.operation, key).ok())
                .flatten();
            apply_to_register(&mut state.register, &item.operation, data);

            state.outbox.restore_failed(FailedOperation {
                operation: item.operation,
                retry_count: item.retry_count,
                error: item.last_error.unwrap_or_default(),
                failed_at: item.updated_at,
            });
        }

        Ok(counts)
    }

    /// Load the local pull cursor; heal the remote copy if it is behind
    async fn load_cursor(&self) -> Result<(), SyncError> {
        let db = self.inner.db.clone();
        let user_id = self.inner.identity.user_id.clone();
        let lookup_id = user_id.clone();
        let local = blocking(move || db.get_sync_metadata(&lookup_id))
            .await?
            .map(|m| m.last_sync_version)
            .unwrap_or(0);

        let cursor = {
            let mut state = self.state();
            state.last_sync_version = state.last_sync_version.max(local);
            state.last_sync_version
        };

        match self.call(self.inner.repository.get_sync_metadata(&user_id)).await {
            Ok(remote) => {
                let remote_version = remote.map(|m| m.last_sync_version);
                log::info!(
                    "Sync cursor: local {}, remote {:?}",
                    cursor,
                    remote_version
                );
                if cursor > 0 && remote_version.map_or(true, |v| v < cursor) {
                    if let Err(e) = self
                        .call(self.inner.repository.upsert_sync_metadata(&user_id, SyncState::Idle, cursor))
                        .await
                    {
                        log::warn!("Failed to update remote sync metadata: {}", e);
                    }
                }
            }
            Err(e) => log::warn!("Could not read remote sync metadata: {}", e),
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self) -> SyncStatus {
        let state = self.state();
        SyncStatus {
            is_syncing: self.is_syncing(),
            is_online: self.is_online(),
            last_sync_time: state.last_sync_time,
            pending_operations: state.outbox.len() + state.outbox.in_flight(),
            failed_operations: state.outbox.permanently_failed().len(),
            sync_errors: state.sync_errors,
            last_sync_version: state.last_sync_version,
            last_cycle_failed: state.last_cycle_failed,
        }
    }

    /// Operations not yet confirmed, including any batch in flight
    pub fn pending_count(&self) -> usize {
        let state = self.state();
        state.outbox.len() + state.outbox.in_flight()
    }

    pub fn sync_errors(&self) -> u64 {
        self.state().sync_errors
    }

    pub fn last_sync_version(&self) -> i64 {
        self.state().last_sync_version
    }

    pub fn permanently_failed(&self) -> Vec<FailedOperation> {
        self.state().outbox.permanently_failed().to_vec()
    }

    /// Durable queue statistics
    pub async fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        let durable = self.inner.durable.clone();
        blocking(move || durable.get_stats()).await
    }

    /// Current merged state of one entity, `None` if absent or deleted
    pub fn entity(&self, entity_id: &str) -> Option<EntityRecord> {
        self.state().register.get(entity_id).cloned()
    }

    /// All present entities in id order
    pub fn entities(&self) -> Vec<(String, EntityRecord)> {
        self.state()
            .register
            .values()
            .into_iter()
            .map(|(id, record)| (id.to_string(), record.clone()))
            .collect()
    }

    // ========================================================================
    // Manual intervention
    // ========================================================================

    /// Put permanently failed operations back into automatic retry
    pub async fn retry_failed_operations(&self) -> Result<usize, SyncError> {
        self.ensure_ready()?;

        let durable = self.inner.durable.clone();
        let reset = blocking(move || durable.retry_failed()).await?;

        let restored = {
            let mut state = self.state();
            let now = Utc::now();
            let failed = state.outbox.take_failed();
            let count = failed.len();
            for item in failed {
                state.outbox.restore(PendingOperation::new(item.operation, now));
            }
            count
        };

        log::info!("Reset {} failed operations for retry ({} in memory)", reset, restored);
        self.emit_status();
        self.trigger();
        Ok(reset)
    }

    /// Discard permanently failed operations
    pub async fn discard_failed_operations(&self) -> Result<usize, SyncError> {
        self.ensure_ready()?;

        let durable = self.inner.durable.clone();
        let cleared = blocking(move || durable.clear_failed()).await?;
        let dropped = self.state().outbox.take_failed().len();

        log::info!("Discarded {} failed operations ({} in memory)", cleared, dropped);
        self.emit_status();
        Ok(cleared)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn state(&self) -> MutexGuard<'_, LocalState> {
        lock(&self.inner.state)
    }

    fn key(&self) -> Result<SyncKey, CryptoError> {
        self.inner.key_provider.sync_key(&self.inner.identity.user_id)
    }

    fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.is_destroyed() {
            Err(SyncError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn ensure_ready(&self) -> Result<(), SyncError> {
        self.ensure_alive()?;
        if self.is_ready() {
            Ok(())
        } else {
            Err(SyncError::NotStarted)
        }
    }

    /// Repository call bounded by the request timeout
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, RepositoryError> {
        match tokio::time::timeout(self.inner.config.request_timeout(), request).await {
            Ok(result) => result,
            Err(_) => Err(RepositoryError::Timeout),
        }
    }

    fn emit(&self, event: SyncEvent) {
        if !self.is_destroyed() {
            self.inner.events.emit(event);
        }
    }

    fn emit_status(&self) {
        self.emit(SyncEvent::StatusChanged(self.status()));
    }
}

/// Scheduler hook; holds the service weakly so dropping it ends the loop
struct RetryTick {
    service: Weak<Inner>,
}

#[async_trait]
impl ScheduledTask for RetryTick {
    async fn tick(&self) -> bool {
        let Some(inner) = self.service.upgrade() else {
            return false;
        };
        let service = SyncService { inner };
        if service.is_destroyed() {
            return false;
        }

        let due = service.state().outbox.has_ready(Utc::now());
        if due && service.is_online() && !service.is_syncing() {
            log::debug!("Retrying operations whose backoff elapsed");
            service.sync_now().await;
        }
        true
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run store I/O off the async workers
async fn blocking<T, E, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<SyncError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(SyncError::Task(e.to_string())),
    }
}

/// Decrypted body of an operation; `None` for deletes
fn plaintext(operation: &SyncOperation, key: &SyncKey) -> Result<Option<Vec<u8>>, CryptoError> {
    match (&operation.payload, operation.operation_type) {
        (_, OperationType::Delete) | (Payload::Tombstone, _) => Ok(None),
        (Payload::Sealed(envelope), _) => open(envelope, key).map(Some),
    }
}

fn note_version(versions: &mut HashMap<String, i64>, operation: &SyncOperation) {
    let known = versions.entry(operation.entity_id.clone()).or_insert(0);
    *known = (*known).max(operation.version);
}

/// Rebuild one register entry from the store; sealed adds need the key
fn restore_entry(
    register: &mut LwwElementSet<EntityRecord>,
    entry: StoredEntry,
    key: Option<&SyncKey>,
) -> bool {
    match entry.payload {
        Payload::Tombstone => register.remove(entry.entity_id, entry.timestamp, entry.origin_id),
        Payload::Sealed(envelope) => {
            let Some(key) = key else {
                return false;
            };
            match open(&envelope, key) {
                Ok(data) => register.add(
                    entry.entity_id,
                    EntityRecord {
                        entity_type: entry.entity_type,
                        version: entry.version,
                        data,
                    },
                    entry.timestamp,
                    entry.origin_id,
                ),
                Err(e) => {
                    log::warn!("Stored entity {} could not be opened: {}", entry.entity_id, e);
                    false
                }
            }
        }
    }
}

/// Feed an operation through the conflict register; true if an entry was taken
fn apply_to_register(
    register: &mut LwwElementSet<EntityRecord>,
    operation: &SyncOperation,
    data: Option<Vec<u8>>,
) -> bool {
    let timestamp = operation.timestamp.timestamp_millis();
    match (operation.operation_type, data) {
        (OperationType::Delete, _) => register.remove(
            operation.entity_id.clone(),
            timestamp,
            operation.session_id.clone(),
        ),
        (_, Some(data)) => register.add(
            operation.entity_id.clone(),
            EntityRecord {
                entity_type: operation.entity_type.clone(),
                version: operation.version,
                data,
            },
            timestamp,
            operation.session_id.clone(),
        ),
        (_, None) => false,
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Queue error: {0}")]
    Queue(QueueError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Sync service has not been started")]
    NotStarted,

    #[error("Sync service has been destroyed")]
    Destroyed,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<QueueError> for SyncError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::QueueFull { capacity } => Self::QueueFull { capacity },
            other => Self::Queue(other),
        }
    }
}
