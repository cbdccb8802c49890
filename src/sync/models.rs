//! Sync Data Models
//!
//! Defines the replication unit and the state the sync core exposes.
//!
//! - SyncOperation: validated operation, payload already sealed
//! - WireOperation: transport shape exchanged with the repository
//! - OperationDraft: what callers hand to the orchestrator
//! - SyncConfig / SessionIdentity: tunables and who is syncing
//! - SyncStatus / SyncState: derived status snapshot

use super::crypto::{CryptoError, Payload};
use crate::db::{Database, DbError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const CONFIG_SETTING_KEY: &str = "sync_config";

// ============================================================================
// Operations
// ============================================================================

/// Mutation kind carried by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Strict parse; unknown kinds are an error, never a default
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(OperationError::UnknownOperationType(other.to_string())),
        }
    }
}

/// Boundary validation failures for incoming operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("Unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("Tombstone payload is only valid for delete operations")]
    TombstoneNotAllowed,

    #[error("Invalid operation id: {0}")]
    InvalidId(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] CryptoError),
}

/// The unit of replication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOperation {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub operation_type: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Payload,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

/// Transport representation of a [`SyncOperation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub operation_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub encrypted_payload: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    /// Set by transports that received a record they could not decode; such
    /// records carry whatever fields could be salvaged and never validate
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl From<&SyncOperation> for WireOperation {
    fn from(op: &SyncOperation) -> Self {
        Self {
            id: op.id.to_string(),
            user_id: op.user_id.clone(),
            session_id: op.session_id.clone(),
            operation_type: op.operation_type.as_str().to_string(),
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            encrypted_payload: op.payload.to_wire(),
            version: op.version,
            timestamp: op.timestamp,
            malformed: None,
        }
    }
}

impl TryFrom<WireOperation> for SyncOperation {
    type Error = OperationError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        if let Some(reason) = wire.malformed {
            return Err(OperationError::Malformed(reason));
        }
        let id = Uuid::parse_str(&wire.id).map_err(|_| OperationError::InvalidId(wire.id.clone()))?;
        let operation_type = OperationType::parse(&wire.operation_type)?;
        let payload = Payload::from_wire(&wire.encrypted_payload)?;

        if payload.is_tombstone() && operation_type != OperationType::Delete {
            return Err(OperationError::TombstoneNotAllowed);
        }

        Ok(Self {
            id,
            user_id: wire.user_id,
            session_id: wire.session_id,
            operation_type,
            entity_type: wire.entity_type,
            entity_id: wire.entity_id,
            payload,
            version: wire.version,
            timestamp: wire.timestamp,
        })
    }
}

/// Body handed to the orchestrator by callers
#[derive(Debug, Clone)]
pub enum DraftBody {
    /// Plaintext to be sealed with the session key
    Plain(Vec<u8>),
    /// Envelope sealed by the caller
    Sealed(super::crypto::Envelope),
}

/// A local mutation before it has an id, version and timestamp
#[derive(Debug, Clone)]
pub struct OperationDraft {
    pub entity_type: String,
    pub entity_id: String,
    pub kind: DraftKind,
}

#[derive(Debug, Clone)]
pub enum DraftKind {
    Create(DraftBody),
    Update(DraftBody),
    Delete,
}

impl OperationDraft {
    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: DraftKind::Create(DraftBody::Plain(data)),
        }
    }

    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: DraftKind::Update(DraftBody::Plain(data)),
        }
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind: DraftKind::Delete,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            DraftKind::Create(_) => OperationType::Create,
            DraftKind::Update(_) => OperationType::Update,
            DraftKind::Delete => OperationType::Delete,
        }
    }
}

/// Decrypted state of one entity as held by the conflict register
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub version: i64,
    pub data: Vec<u8>,
}

// ============================================================================
// Identity & Configuration
// ============================================================================

/// Who is syncing: account, device session and a display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub user_id: String,
    pub session_id: String,
    pub device_name: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            device_name: default_device_name(),
        }
    }

    /// New identity with a random session id
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Uuid::new_v4().to_string())
    }
}

/// Get default device name from hostname
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown Device".to_string())
}

/// Sync tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Hard cap on operations held in the in-memory queue
    pub queue_capacity: usize,

    /// Operations pushed per cycle
    pub batch_size: usize,

    /// Failed attempts after which an operation is permanently failed
    pub max_retries: u32,

    /// Backoff base; delay is `base * 2^retry_count`
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay
    pub backoff_max_ms: u64,

    /// Operations requested per pull page
    pub pull_page_size: usize,

    /// Timeout applied to every repository call
    pub request_timeout_secs: u64,

    /// Background retry tick
    pub retry_interval_secs: u64,

    /// Run a cycle right after `start()`
    pub sync_on_startup: bool,

    /// Run a cycle after every enqueue while online
    pub sync_on_enqueue: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 10,
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 3_600_000,
            pull_page_size: 100,
            request_timeout_secs: 30,
            retry_interval_secs: 15,
            sync_on_startup: true,
            sync_on_enqueue: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if self.batch_size == 0 || self.batch_size > self.queue_capacity {
            return Err(format!(
                "batch_size must be 1-{}, got {}",
                self.queue_capacity, self.batch_size
            ));
        }
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err("backoff_base_ms must be > 0 and <= backoff_max_ms".to_string());
        }
        if self.pull_page_size == 0 {
            return Err("pull_page_size must be greater than 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        if !(1..=3600).contains(&self.retry_interval_secs) {
            return Err(format!(
                "retry_interval_secs must be 1-3600, got {}",
                self.retry_interval_secs
            ));
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Load persisted config, falling back to defaults
    pub fn load(db: &Database) -> Result<Self, DbError> {
        Ok(db.get_setting(CONFIG_SETTING_KEY)?.unwrap_or_default())
    }

    pub fn save(&self, db: &Database) -> Result<(), DbError> {
        db.set_setting(CONFIG_SETTING_KEY, self)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

/// Derived sync status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub sync_errors: u64,
    pub last_sync_version: i64,
    /// The most recent cycle hit a pull error or a failed push
    pub last_cycle_failed: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_syncing: false,
            is_online: true,
            last_sync_time: None,
            pending_operations: 0,
            failed_operations: 0,
            sync_errors: 0,
            last_sync_version: 0,
            last_cycle_failed: false,
        }
    }
}

impl SyncStatus {
    pub fn state(&self) -> SyncState {
        if self.is_syncing {
            SyncState::Syncing
        } else if self.last_cycle_failed {
            SyncState::Error
        } else {
            SyncState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::crypto::{seal, SyncKey, TOMBSTONE_MARKER};

    fn wire(operation_type: &str, payload: String) -> WireOperation {
        WireOperation {
            id: Uuid::new_v4().to_string(),
            user_id: "user-1".to_string(),
            session_id: "session-a".to_string(),
            operation_type: operation_type.to_string(),
            entity_type: "note".to_string(),
            entity_id: "note-1".to_string(),
            encrypted_payload: payload,
            version: 3,
            timestamp: Utc::now(),
            malformed: None,
        }
    }

    fn sealed_wire() -> String {
        let key = SyncKey::from_bytes([1u8; 32]);
        seal(b"{}", &key).unwrap().to_wire()
    }

    #[test]
    fn test_wire_roundtrip() {
        let op = SyncOperation::try_from(wire("update", sealed_wire())).unwrap();
        assert_eq!(op.operation_type, OperationType::Update);

        let back = WireOperation::from(&op);
        assert_eq!(SyncOperation::try_from(back).unwrap(), op);
    }

    #[test]
    fn test_unknown_operation_type_rejected() {
        let result = SyncOperation::try_from(wire("upsert", sealed_wire()));
        assert_eq!(
            result.unwrap_err(),
            OperationError::UnknownOperationType("upsert".to_string())
        );
    }

    #[test]
    fn test_tombstone_only_for_delete() {
        let delete = SyncOperation::try_from(wire("delete", TOMBSTONE_MARKER.to_string())).unwrap();
        assert!(delete.payload.is_tombstone());

        let create = SyncOperation::try_from(wire("create", TOMBSTONE_MARKER.to_string()));
        assert_eq!(create.unwrap_err(), OperationError::TombstoneNotAllowed);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let result = SyncOperation::try_from(wire("create", "only:two".to_string()));
        assert!(matches!(
            result,
            Err(OperationError::Payload(CryptoError::MalformedPayload(_)))
        ));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let mut bad = wire("create", sealed_wire());
        bad.id = "not-a-uuid".to_string();
        assert!(matches!(
            SyncOperation::try_from(bad),
            Err(OperationError::InvalidId(_))
        ));
    }

    #[test]
    fn test_undecodable_record_rejected() {
        let mut bad = wire("create", sealed_wire());
        bad.malformed = Some("missing field `entityId`".to_string());
        assert_eq!(
            SyncOperation::try_from(bad).unwrap_err(),
            OperationError::Malformed("missing field `entityId`".to_string())
        );
    }

    #[test]
    fn test_status_state_reports_failed_cycle() {
        let mut status = SyncStatus::default();
        assert_eq!(status.state(), SyncState::Idle);

        status.last_cycle_failed = true;
        assert_eq!(status.state(), SyncState::Error);

        status.is_syncing = true;
        assert_eq!(status.state(), SyncState::Syncing);
    }

    #[test]
    fn test_wire_json_is_camel_case() {
        let json = serde_json::to_value(wire("create", sealed_wire())).unwrap();
        assert!(json.get("operationType").is_some());
        assert!(json.get("encryptedPayload").is_some());
        assert!(json.get("entityId").is_some());
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = SyncConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 5);
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.batch_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.retry_interval_secs = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_persistence() {
        let db = Database::in_memory().unwrap();
        assert_eq!(SyncConfig::load(&db).unwrap(), SyncConfig::default());

        let config = SyncConfig {
            batch_size: 25,
            backoff_base_ms: 5_000,
            ..SyncConfig::default()
        };
        config.save(&db).unwrap();

        assert_eq!(SyncConfig::load(&db).unwrap(), config);
    }

    #[test]
    fn test_draft_operation_types() {
        assert_eq!(
            OperationDraft::create("note", "n1", vec![1]).operation_type(),
            OperationType::Create
        );
        assert_eq!(
            OperationDraft::delete("note", "n1").operation_type(),
            OperationType::Delete
        );
    }
}
