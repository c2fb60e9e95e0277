//! Update orchestration
//!
//! Drives one patch request through
//! `Fetched → Validated → Applied → EntityCommitted → Audited`. Any failure
//! before the commit leaves storage untouched. After the commit the entity
//! change stands even if the audit append never succeeds.

use crate::audit::{AuditInput, AuditRecord, AuditRecorder};
use crate::clock::Clock;
use crate::config::PatchEngineConfig;
use crate::entity::{CorrelationId, Entity, EntitySchema, Version};
use crate::errors::{ErrorCategory, ErrorDetails, PatchError, Result};
use crate::patch::{ValidatedPatch, apply, build_inverse, validate, validate_document};
use crate::store::{PutOutcome, Storage, StoreError, with_timeout};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pipeline stage of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStage {
    Fetched,
    Validated,
    Applied,
    EntityCommitted,
    Audited,
    Failed,
}

impl PatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Validated => "validated",
            Self::Applied => "applied",
            Self::EntityCommitted => "entity_committed",
            Self::Audited => "audited",
            Self::Failed => "failed",
        }
    }
}

/// Whether the audit record for a committed change was persisted
#[derive(Debug, Clone, PartialEq)]
pub enum AuditStatus {
    Recorded(Uuid),
    /// The entity change committed but the append kept failing. The record
    /// was logged in full at `warn` so it can be reconstructed.
    Pending { audit_id: Uuid, error: String },
}

impl AuditStatus {
    pub fn audit_id(&self) -> Uuid {
        match self {
            Self::Recorded(id) | Self::Pending { audit_id: id, .. } => *id,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// Result of a committed patch
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    /// Entity as committed
    pub entity: Entity,
    pub new_version: Version,
    pub audit: AuditStatus,
}

/// Where the operations of a request come from
enum PatchSource<'a> {
    Request(&'a [u8]),
    Revert(&'a AuditRecord),
}

/// Logs stage transitions for one request
struct StageTracker {
    current: Option<PatchStage>,
    started: Instant,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: None,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, stage: PatchStage) {
        tracing::debug!(
            from = self.current.map(|s| s.as_str()).unwrap_or("start"),
            stage = stage.as_str(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "stage transition"
        );
        self.current = Some(stage);
    }

    fn fail(&mut self, error: &PatchError) {
        let reached = self.current.map(|s| s.as_str()).unwrap_or("start");
        match error.category() {
            ErrorCategory::Internal => tracing::error!(
                stage = PatchStage::Failed.as_str(),
                reached,
                kind = error.kind().as_str(),
                error = %error,
                "patch request failed"
            ),
            _ => tracing::debug!(
                stage = PatchStage::Failed.as_str(),
                reached,
                kind = error.kind().as_str(),
                error = %error,
                "patch request failed"
            ),
        }
        self.current = Some(PatchStage::Failed);
    }
}

/// Runs patch requests against one storage backend.
pub struct UpdateOrchestrator {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    schema: EntitySchema,
    recorder: AuditRecorder,
    storage_timeout: Duration,
}

impl UpdateOrchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        schema: EntitySchema,
        config: &PatchEngineConfig,
    ) -> Self {
        let storage_timeout = config.storage_timeout();
        let recorder = AuditRecorder::new(
            store.clone(),
            config.audit_retry.to_retry_config(),
            storage_timeout,
        );
        Self {
            store,
            clock,
            schema,
            recorder,
            storage_timeout,
        }
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    /// Apply raw patch bytes to the entity `entity_id`.
    #[tracing::instrument(
        name = "apply_patch",
        skip_all,
        fields(entity_id = %entity_id, correlation_id = %correlation_id)
    )]
    pub async fn apply_patch(
        &self,
        entity_id: &str,
        patch: &[u8],
        correlation_id: &CorrelationId,
    ) -> Result<PatchOutcome> {
        self.execute(entity_id, PatchSource::Request(patch), correlation_id)
            .await
    }

    /// Undo the change recorded as `audit_id` by applying its inverse.
    ///
    /// The entity must still be at the version that change produced;
    /// otherwise later changes would be silently overwritten.
    #[tracing::instrument(
        name = "revert",
        skip_all,
        fields(audit_id = %audit_id, correlation_id = %correlation_id)
    )]
    pub async fn revert(
        &self,
        audit_id: &Uuid,
        correlation_id: &CorrelationId,
    ) -> Result<PatchOutcome> {
        let record = with_timeout(self.storage_timeout, self.store.get_audit(audit_id))
            .await
            .map_err(|e| store_error("failed to load audit record", e))
            .and_then(|r| r.ok_or_else(|| PatchError::audit_does_not_exist(&audit_id.to_string())))
            .map_err(|e| e.with_correlation(correlation_id.as_str()))?;

        self.execute(&record.entity_id, PatchSource::Revert(&record), correlation_id)
            .await
    }

    /// Audit trail of `entity_id`, oldest first.
    pub async fn history(&self, entity_id: &str) -> Result<Vec<AuditRecord>> {
        let entity = self.fetch(entity_id).await?;
        if entity.is_none() {
            return Err(PatchError::object_does_not_exist(entity_id));
        }
        with_timeout(self.storage_timeout, self.store.list_audit(entity_id))
            .await
            .map_err(|e| store_error("failed to list audit records", e).with_entity(entity_id))
    }

    async fn execute(
        &self,
        entity_id: &str,
        source: PatchSource<'_>,
        correlation_id: &CorrelationId,
    ) -> Result<PatchOutcome> {
        let mut tracker = StageTracker::new();
        match self
            .run(entity_id, source, correlation_id, &mut tracker)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracker.fail(&e);
                Err(e
                    .with_entity(entity_id)
                    .with_correlation(correlation_id.as_str()))
            }
        }
    }

    async fn run(
        &self,
        entity_id: &str,
        source: PatchSource<'_>,
        correlation_id: &CorrelationId,
        tracker: &mut StageTracker,
    ) -> Result<PatchOutcome> {
        let entity = self
            .fetch(entity_id)
            .await?
            .ok_or_else(|| PatchError::object_does_not_exist(entity_id))?;
        tracker.advance(PatchStage::Fetched);

        let (patch, reverts) = self.validated(&entity, &source)?;
        tracker.advance(PatchStage::Validated);

        let new_fields = apply(&entity.fields, &patch)?;
        self.schema.check_values(&new_fields)?;
        // Built before the commit so an inverse fault never leaves a change
        // without its undo.
        let inverse = build_inverse(&entity.fields, &patch, &new_fields)?;
        tracker.advance(PatchStage::Applied);

        let next = entity.successor(new_fields, self.clock.now());
        self.commit(&next, entity.version).await?;
        tracker.advance(PatchStage::EntityCommitted);

        let audit = self
            .record_audit(AuditInput {
                entity_id: entity_id.to_string(),
                correlation_id: correlation_id.clone(),
                forward_patch: patch.into_document(),
                inverse_patch: inverse,
                pre_version: entity.version,
                post_version: next.version,
                timestamp: next.modified,
                reverts,
            })
            .await;
        if audit.is_recorded() {
            tracker.advance(PatchStage::Audited);
        }

        tracing::info!(
            new_version = %next.version,
            audit_id = %audit.audit_id(),
            audit_recorded = audit.is_recorded(),
            elapsed_ms = tracker.started.elapsed().as_millis() as u64,
            "patch committed"
        );

        Ok(PatchOutcome {
            new_version: next.version,
            entity: next,
            audit,
        })
    }

    async fn fetch(&self, entity_id: &str) -> Result<Option<Entity>> {
        with_timeout(self.storage_timeout, self.store.get(entity_id))
            .await
            .map_err(|e| store_error("failed to fetch user", e))
    }

    fn validated(
        &self,
        entity: &Entity,
        source: &PatchSource<'_>,
    ) -> Result<(ValidatedPatch, Option<Uuid>)> {
        match source {
            PatchSource::Request(bytes) => Ok((validate(&self.schema, bytes)?, None)),
            PatchSource::Revert(record) => {
                if entity.version != record.post_version {
                    return Err(PatchError::concurrency_conflict(
                        &entity.id,
                        &record.post_version.to_string(),
                    ));
                }
                let patch = validate_document(&self.schema, &record.inverse_patch)?;
                Ok((patch, Some(record.audit_id)))
            }
        }
    }

    /// Conditional write on the fetched version. Never retried.
    async fn commit(&self, next: &Entity, expected: Version) -> Result<()> {
        let outcome = with_timeout(self.storage_timeout, self.store.put_if_version(next, expected))
            .await
            .map_err(|e| store_error("failed to commit user", e))?;

        match outcome {
            PutOutcome::Committed => Ok(()),
            PutOutcome::VersionConflict { current: None } => {
                Err(PatchError::object_does_not_exist(&next.id))
            }
            PutOutcome::VersionConflict {
                current: Some(current),
            } => {
                tracing::debug!(
                    expected = %expected,
                    current = %current,
                    "lost optimistic concurrency race"
                );
                Err(PatchError::concurrency_conflict(
                    &next.id,
                    &expected.to_string(),
                ))
            }
        }
    }

    async fn record_audit(&self, input: AuditInput) -> AuditStatus {
        match self.recorder.record(input).await {
            Ok(record) => AuditStatus::Recorded(record.audit_id),
            Err(failure) => {
                let record_json = serde_json::to_string(&failure.record)
                    .unwrap_or_else(|e| format!("<unserializable record: {e}>"));
                tracing::warn!(
                    audit_id = %failure.record.audit_id,
                    post_version = %failure.record.post_version,
                    error = %failure.error,
                    record = %record_json,
                    "audit append failed after retries; change committed without audit record"
                );
                AuditStatus::Pending {
                    audit_id: failure.record.audit_id,
                    error: failure.error.to_string(),
                }
            }
        }
    }
}

/// Map a storage failure onto the caller-facing taxonomy
pub(crate) fn store_error(context: &str, error: StoreError) -> PatchError {
    match error {
        StoreError::Duplicate { field, value } => {
            let mut details = ErrorDetails {
                attribute: Some(field.clone()),
                ..Default::default()
            };
            if field == "email" {
                details.email = Some(value.clone());
            }
            PatchError::duplicate_insert(
                format!("a user with {field} '{value}' already exists"),
                details,
            )
        }
        other => PatchError::storage(context, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::errors::ErrorKind;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};

    fn fixture() -> (Arc<MemoryStore>, UpdateOrchestrator) {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut fields = Map::new();
        fields.insert("email".to_string(), json!("a@example.com"));
        fields.insert("status".to_string(), json!("active"));
        let store = Arc::new(MemoryStore::with_entities([Entity::new("u1", fields, created)]));

        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let orchestrator = UpdateOrchestrator::new(
            store.clone(),
            Arc::new(clock),
            EntitySchema::user(),
            &PatchEngineConfig::default(),
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_patch_commits_and_audits() {
        let (store, orchestrator) = fixture();
        let patch = br#"[{"op":"replace","path":"/status","value":"suspended"}]"#;

        let outcome = orchestrator
            .apply_patch("u1", patch, &CorrelationId::from("c-1"))
            .await
            .expect("patch");

        assert_eq!(outcome.new_version.to_string(), "v2");
        assert_eq!(outcome.entity.field_str("status"), Some("suspended"));
        assert_eq!(
            outcome.entity.modified,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );

        let history = orchestrator.history("u1").await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].audit_id, outcome.audit.audit_id());
        assert_eq!(
            history[0].inverse_patch.to_json(),
            json!([{"op": "replace", "path": "/status", "value": "active"}])
        );
        assert_eq!(store.audit_count().await, 1);
    }

    #[tokio::test]
    async fn test_disallowed_status_is_rejected_before_commit() {
        let (store, orchestrator) = fixture();
        let patch = br#"[{"op":"replace","path":"/status","value":"on-holiday"}]"#;

        let err = orchestrator
            .apply_patch("u1", patch, &CorrelationId::from("c-2"))
            .await
            .expect_err("should reject");
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert_eq!(err.details().entity_id.as_deref(), Some("u1"));

        let stored = store.get("u1").await.expect("get").expect("exists");
        assert_eq!(stored.version, Version::INITIAL);
        assert_eq!(store.audit_count().await, 0);
    }

    #[tokio::test]
    async fn test_revert_requires_unchanged_version() {
        let (_store, orchestrator) = fixture();
        let correlation = CorrelationId::from("c-3");

        let first = orchestrator
            .apply_patch(
                "u1",
                br#"[{"op":"replace","path":"/status","value":"suspended"}]"#,
                &correlation,
            )
            .await
            .expect("first");
        orchestrator
            .apply_patch(
                "u1",
                br#"[{"op":"add","path":"/title","value":"Dr"}]"#,
                &correlation,
            )
            .await
            .expect("second");

        let err = orchestrator
            .revert(&first.audit.audit_id(), &correlation)
            .await
            .expect_err("stale revert");
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    }

    #[test]
    fn test_duplicate_email_maps_to_duplicate_insert() {
        let err = store_error(
            "ctx",
            StoreError::Duplicate {
                field: "email".to_string(),
                value: "a@example.com".to_string(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::DuplicateInsert);
        assert_eq!(err.details().email.as_deref(), Some("a@example.com"));
    }
}
