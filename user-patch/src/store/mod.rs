//! Storage collaborator
//!
//! The engine reaches entities and audit records only through [`Storage`].
//! Two implementations ship: [`MemoryStore`] for tests and embedding, and
//! [`SqliteStore`] for the CLI.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::audit::AuditRecord;
use crate::entity::{Entity, Version};
use crate::retry::RetryClassifiable;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Errors from a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate {field}: {value}")]
    Duplicate { field: String, value: String },

    #[error("database error: {message}")]
    Database {
        message: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt stored record: {0}")]
    Corrupt(String),

    /// The blocking task running the call panicked or was cancelled
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    pub fn database(message: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            message: message.into(),
            source,
        }
    }
}

impl RetryClassifiable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) => true,
            Self::Database { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Duplicate { .. } | Self::Corrupt(_) | Self::TaskFailed(_) => false,
        }
    }
}

/// Result of a conditional entity write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Committed,
    /// Another writer got there first. `current` is `None` when the entity
    /// no longer exists at all.
    VersionConflict { current: Option<Version> },
}

/// Durable home for user entities and their audit trail.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, entity_id: &str) -> Result<Option<Entity>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Entity>, StoreError>;

    /// Insert a new entity; id and email must both be unused.
    async fn insert(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Write `entity` only if the stored version still equals `expected`.
    async fn put_if_version(
        &self,
        entity: &Entity,
        expected: Version,
    ) -> Result<PutOutcome, StoreError>;

    /// Append an audit record. Appending the same `audit_id` twice is a
    /// no-op, so retries never duplicate records.
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn get_audit(&self, audit_id: &Uuid) -> Result<Option<AuditRecord>, StoreError>;

    /// Audit records for one entity, oldest first
    async fn list_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>, StoreError>;
}

/// Bound a storage call; an elapsed deadline becomes [`StoreError::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
