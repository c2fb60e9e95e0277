//! Audit trail for committed patches
//!
//! Each committed patch leaves one immutable [`AuditRecord`] holding the
//! forward patch and the inverse that undoes it. Records are appended only
//! after the entity write has committed.

use crate::entity::{CorrelationId, Version};
use crate::patch::PatchDocument;
use crate::retry::{RetryConfig, execute_with_backoff};
use crate::store::{Storage, StoreError, with_timeout};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One committed change and how to undo it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub entity_id: String,
    pub correlation_id: CorrelationId,
    pub recorded_at: DateTime<Utc>,
    pub forward_patch: PatchDocument,
    pub inverse_patch: PatchDocument,
    pub pre_version: Version,
    pub post_version: Version,
    /// Set when this change was itself an undo of an earlier record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<Uuid>,
}

/// Input for recording a change
#[derive(Debug, Clone)]
pub struct AuditInput {
    pub entity_id: String,
    pub correlation_id: CorrelationId,
    pub forward_patch: PatchDocument,
    pub inverse_patch: PatchDocument,
    pub pre_version: Version,
    pub post_version: Version,
    pub timestamp: DateTime<Utc>,
    pub reverts: Option<Uuid>,
}

impl AuditRecord {
    /// Build the record; the id is fixed here so every retry appends the
    /// same record.
    pub fn new(input: AuditInput) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            entity_id: input.entity_id,
            correlation_id: input.correlation_id,
            recorded_at: input.timestamp,
            forward_patch: input.forward_patch,
            inverse_patch: input.inverse_patch,
            pre_version: input.pre_version,
            post_version: input.post_version,
            reverts: input.reverts,
        }
    }
}

/// Failure to persist an already-built record
#[derive(Debug)]
pub struct AuditWriteFailure {
    /// The record that could not be stored, kept for reconstruction
    pub record: AuditRecord,
    pub error: StoreError,
}

/// Builds audit records and appends them with bounded retry.
pub struct AuditRecorder {
    store: Arc<dyn Storage>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Storage>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            call_timeout,
        }
    }

    /// Persist the record for a committed change.
    ///
    /// Transient failures (timeouts included) are retried up to the
    /// configured limit.
    pub async fn record(
        &self,
        input: AuditInput,
    ) -> std::result::Result<AuditRecord, Box<AuditWriteFailure>> {
        let record = AuditRecord::new(input);

        let result = execute_with_backoff(
            || with_timeout(self.call_timeout, self.store.append_audit(&record)),
            &self.retry,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    audit_id = %record.audit_id,
                    entity_id = %record.entity_id,
                    correlation_id = %record.correlation_id,
                    post_version = %record.post_version,
                    "audit record appended"
                );
                Ok(record)
            }
            Err(error) => Err(Box::new(AuditWriteFailure { record, error })),
        }
    }
}
