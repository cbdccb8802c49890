//! Sync Module - Offline-first encrypted operation sync
//!
//! Replicates per-entity create/update/delete operations between devices
//! through a central operation log.
//!
//! Architecture:
//! - Zero-Knowledge: payloads are sealed (XChaCha20-Poly1305) before they
//!   leave the device; the server only stores ciphertext
//! - Offline-first: every local change is written to a durable SQLite queue
//!   before it counts as queued, and survives restarts
//! - Conflict Resolution: last-writer-wins element set with a deterministic
//!   tie-break on origin session id

pub mod api;
pub mod crypto;
pub mod events;
pub mod lww;
pub mod manager;
pub mod models;
pub mod outbox;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod store;


// Re-export commonly used types
pub use crypto::{
    derive_key_from_password, generate_salt, open, seal, CryptoError, Envelope, KeyProvider,
    PasswordKeyProvider, Payload, StaticKeyProvider, SyncKey,
};

pub use models::{
    DraftBody, DraftKind, EntityRecord, OperationDraft, OperationError, OperationType,
    SessionIdentity, SyncConfig, SyncOperation, SyncState, SyncStatus, WireOperation,
};

pub use api::{HttpRepository, HttpRepositoryConfig};
pub use events::{CycleReport, EventBus, SyncEvent};
pub use lww::LwwElementSet;
pub use manager::{CycleOutcome, SyncError, SyncService};
pub use outbox::{FailedOperation, OperationQueue, PendingOperation};
pub use queue::{OfflineQueue, QueueError, QueueStats, QueuedOperation, RetryPolicy};
pub use repository::{
    ChangeCallback, PushResult, Repository, RepositoryError, Subscription, SyncMetadata,
};
pub use scheduler::{BackgroundScheduler, SchedulerError};
pub use store::{EntityStore, StoredEntry};
