//! # Sealed Sync
//!
//! Offline-first, end-to-end encrypted operation sync. Local changes are
//! sealed, queued durably in SQLite and replicated through a central
//! operation log; remote changes merge through a last-writer-wins register.

pub mod db;
pub mod sync;

pub use db::{Database, DbError};
pub use sync::{
    HttpRepository, HttpRepositoryConfig, OperationDraft, SessionIdentity, SyncConfig, SyncEvent,
    SyncService,
};

/// Initialize the process logger (`RUST_LOG` overrides the default `info`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    if env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .is_err()
    {
        log::debug!("Logger already initialized");
    }
}
