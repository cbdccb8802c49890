//! Entity Store - persisted conflict state
//!
//! Keeps what the orchestrator needs to resume after a restart without
//! replaying history:
//! - Per-entity version high-water marks (local and remote)
//! - The winning add and remove entry of the conflict register per entity
//!
//! Add entries keep the sealed payload, so nothing is stored in plaintext.
//! Writes go through the same keep-greater rule as the in-memory register,
//! so concurrent writers converge regardless of commit order.

use super::crypto::Payload;
use super::lww::LwwElementSet;
use super::models::{OperationType, SyncOperation};
use crate::db::{Database, DbError, DbResult};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::sync::Arc;

/// One persisted register entry; a tombstone payload marks a remove entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub entity_id: String,
    pub entity_type: String,
    pub version: i64,
    pub timestamp: i64,
    pub origin_id: String,
    pub payload: Payload,
}

impl StoredEntry {
    pub fn is_remove(&self) -> bool {
        self.payload.is_tombstone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Add,
    Remove,
}

impl EntryKind {
    fn of(operation: &SyncOperation) -> Self {
        if operation.operation_type == OperationType::Delete || operation.payload.is_tombstone() {
            Self::Remove
        } else {
            Self::Add
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

struct CurrentRow {
    stamp_ts: i64,
    origin_id: String,
    entity_type: String,
    version: i64,
    payload: Option<String>,
}

/// Persisted versions and register entries for one user
pub struct EntityStore {
    db: Arc<Database>,
    user_id: String,
}

impl EntityStore {
    pub fn new(db: Arc<Database>, user_id: impl Into<String>) -> Self {
        Self {
            db,
            user_id: user_id.into(),
        }
    }

    /// Record an applied operation
    ///
    /// Raises the entity's version high-water mark and stores the register
    /// entry if it beats the stored one. Returns true when the entry was taken.
    pub fn record(&self, operation: &SyncOperation) -> DbResult<bool> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO entity_versions (user_id, entity_id, version)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, entity_id) DO UPDATE SET
                version = MAX(version, excluded.version)
            "#,
            params![self.user_id, operation.entity_id, operation.version],
        )?;

        let kind = EntryKind::of(operation);
        let current = tx
            .query_row(
                r#"
                SELECT stamp_ts, origin_id, entity_type, version, payload
                FROM entity_state
                WHERE user_id = ?1 AND entity_id = ?2 AND kind = ?3
                "#,
                params![self.user_id, operation.entity_id, kind.as_str()],
                |row| {
                    Ok(CurrentRow {
                        stamp_ts: row.get(0)?,
                        origin_id: row.get(1)?,
                        entity_type: row.get(2)?,
                        version: row.get(3)?,
                        payload: row.get(4)?,
                    })
                },
            )
            .optional()?;

        let id = operation.entity_id.as_str();
        let timestamp = operation.timestamp.timestamp_millis();
        let payload = match kind {
            EntryKind::Add => Some(operation.payload.to_wire()),
            EntryKind::Remove => None,
        };

        // Single-element register seeded with the stored winner
        let mut register: LwwElementSet<(String, i64, String)> = LwwElementSet::new();
        let taken = match kind {
            EntryKind::Add => {
                if let Some(row) = current {
                    register.add(
                        id,
                        (row.entity_type, row.version, row.payload.unwrap_or_default()),
                        row.stamp_ts,
                        row.origin_id,
                    );
                }
                register.add(
                    id,
                    (
                        operation.entity_type.clone(),
                        operation.version,
                        payload.clone().unwrap_or_default(),
                    ),
                    timestamp,
                    operation.session_id.clone(),
                )
            }
            EntryKind::Remove => {
                if let Some(row) = current {
                    register.remove(id, row.stamp_ts, row.origin_id);
                }
                register.remove(id, timestamp, operation.session_id.clone())
            }
        };

        if taken {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO entity_state (
                    user_id, entity_id, kind, stamp_ts, origin_id,
                    entity_type, version, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    self.user_id,
                    operation.entity_id,
                    kind.as_str(),
                    timestamp,
                    operation.session_id,
                    operation.entity_type,
                    operation.version,
                    payload,
                ],
            )?;
        }

        tx.commit()?;
        Ok(taken)
    }

    /// Version high-water mark per entity
    pub fn versions(&self) -> DbResult<HashMap<String, i64>> {
        let rows = self.db.query(
            "SELECT entity_id, version FROM entity_versions WHERE user_id = ?1",
            params![self.user_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(rows.into_iter().collect())
    }

    /// Every stored register entry; unreadable add rows are skipped
    pub fn entries(&self) -> DbResult<Vec<StoredEntry>> {
        let rows = self.db.query(
            r#"
            SELECT entity_id, kind, stamp_ts, origin_id, entity_type, version, payload
            FROM entity_state
            WHERE user_id = ?1
            ORDER BY entity_id, kind
            "#,
            params![self.user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;

        let mut entries = Vec::with_capacity(rows.len());
        for (entity_id, kind, timestamp, origin_id, entity_type, version, payload) in rows {
            let payload = match (kind.as_str(), payload) {
                ("remove", _) => Payload::Tombstone,
                (_, Some(wire)) => match Payload::from_wire(&wire) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Skipping stored entry for {}: {}", entity_id, e);
                        continue;
                    }
                },
                (_, None) => {
                    log::warn!("Skipping stored entry for {}: missing payload", entity_id);
                    continue;
                }
            };

            entries.push(StoredEntry {
                entity_id,
                entity_type,
                version,
                timestamp,
                origin_id,
                payload,
            });
        }

        log::debug!("Loaded {} stored register entries", entries.len());
        Ok(entries)
    }

    /// Drop all stored state for this user
    pub fn clear(&self) -> DbResult<()> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entity_versions WHERE user_id = ?1", params![self.user_id])?;
        tx.execute("DELETE FROM entity_state WHERE user_id = ?1", params![self.user_id])?;
        tx.commit().map_err(DbError::from)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::crypto::{seal, SyncKey};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(Database::in_memory().unwrap()), "user-1")
    }

    fn op(entity: &str, kind: OperationType, version: i64, offset_ms: i64, session: &str) -> SyncOperation {
        let payload = if kind == OperationType::Delete {
            Payload::Tombstone
        } else {
            Payload::Sealed(seal(b"body", &SyncKey::from_bytes([3u8; 32])).unwrap())
        };
        SyncOperation {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            session_id: session.to_string(),
            operation_type: kind,
            entity_type: "note".to_string(),
            entity_id: entity.to_string(),
            payload,
            version,
            timestamp: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    #[test]
    fn test_versions_keep_maximum() {
        let store = store();
        store.record(&op("x", OperationType::Update, 4, 0, "a")).unwrap();
        store.record(&op("x", OperationType::Update, 2, 10, "a")).unwrap();
        store.record(&op("y", OperationType::Create, 1, 0, "a")).unwrap();

        let versions = store.versions().unwrap();
        assert_eq!(versions.get("x"), Some(&4));
        assert_eq!(versions.get("y"), Some(&1));
    }

    #[test]
    fn test_older_entry_does_not_replace_winner() {
        let store = store();
        let newer = op("x", OperationType::Update, 2, 1_000, "a");
        let older = op("x", OperationType::Update, 1, 0, "b");

        assert!(store.record(&newer).unwrap());
        assert!(!store.record(&older).unwrap());

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[0].origin_id, "a");
        assert_eq!(entries[0].payload, newer.payload);
    }

    #[test]
    fn test_remove_entry_stored_alongside_add() {
        let store = store();
        store.record(&op("x", OperationType::Create, 1, 0, "a")).unwrap();
        store.record(&op("x", OperationType::Delete, 2, 10, "a")).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_remove());
        assert!(entries[1].is_remove());
    }

    #[test]
    fn test_users_are_isolated_and_clear() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mine = EntityStore::new(db.clone(), "user-1");
        let theirs = EntityStore::new(db, "user-2");

        mine.record(&op("x", OperationType::Create, 1, 0, "a")).unwrap();
        assert!(theirs.entries().unwrap().is_empty());
        assert!(theirs.versions().unwrap().is_empty());

        mine.clear().unwrap();
        assert!(mine.entries().unwrap().is_empty());
        assert!(mine.versions().unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = EntityStore::new(Arc::new(Database::new(path.clone()).unwrap()), "user-1");
            store.record(&op("x", OperationType::Create, 7, 0, "a")).unwrap();
        }

        let store = EntityStore::new(Arc::new(Database::new(path).unwrap()), "user-1");
        assert_eq!(store.versions().unwrap().get("x"), Some(&7));
        assert_eq!(store.entries().unwrap().len(), 1);
    }
}
