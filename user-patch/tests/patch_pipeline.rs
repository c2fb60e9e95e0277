//! End-to-end tests for the patch pipeline
//!
//! Exercise the orchestrator against the in-memory store, wrapped where
//! needed to inject transient audit failures or to line writers up on the
//! same version.

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Barrier;
use user_patch::patch::{apply, validate_document};
use user_patch::{
    AuditRecord, AuditStatus, CorrelationId, Entity, EntitySchema, ErrorKind, FixedClock,
    MemoryStore, PatchEngineConfig, PatchError, PutOutcome, Storage, StoreError,
    UpdateOrchestrator, Version,
};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

fn user_u1() -> Entity {
    let mut fields = Map::new();
    fields.insert("email".to_string(), json!("u1@example.com"));
    fields.insert("first_name".to_string(), json!("Grace"));
    fields.insert("status".to_string(), json!("active"));
    Entity::new(
        "u1",
        fields,
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
}

fn fast_config() -> PatchEngineConfig {
    let mut config = PatchEngineConfig::default();
    config.audit_retry.initial_backoff_ms = 1;
    config.audit_retry.max_backoff_ms = 5;
    config.storage_timeout_ms = 1_000;
    config
}

fn orchestrator(store: Arc<dyn Storage>) -> UpdateOrchestrator {
    let clock = FixedClock(Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap());
    UpdateOrchestrator::new(
        store,
        Arc::new(clock),
        EntitySchema::user(),
        &fast_config(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock stores
// ─────────────────────────────────────────────────────────────────────────────

/// Fails the first `failures` audit appends with a transient error
struct FlakyAuditStore {
    inner: MemoryStore,
    failures: u32,
    append_calls: AtomicU32,
}

impl FlakyAuditStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::with_entities([user_u1()]),
            failures,
            append_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Storage for FlakyAuditStore {
    async fn get(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        self.inner.get(entity_id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entity>, StoreError> {
        self.inner.find_by_email(email).await
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        self.inner.insert(entity).await
    }

    async fn put_if_version(
        &self,
        entity: &Entity,
        expected: Version,
    ) -> Result<PutOutcome, StoreError> {
        self.inner.put_if_version(entity, expected).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let call = self.append_calls.fetch_add(1, Ordering::SeqCst);
        // The entity must already be committed whenever an append is tried.
        let current = self.inner.get(&record.entity_id).await?;
        assert_eq!(current.map(|e| e.version), Some(record.post_version));

        if call < self.failures {
            return Err(StoreError::Unavailable(format!("audit table offline ({call})")));
        }
        self.inner.append_audit(record).await
    }

    async fn get_audit(&self, audit_id: &Uuid) -> Result<Option<AuditRecord>, StoreError> {
        self.inner.get_audit(audit_id).await
    }

    async fn list_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        self.inner.list_audit(entity_id).await
    }
}

/// Holds every reader at a barrier so all writers fetch the same version
struct RacingStore {
    inner: MemoryStore,
    barrier: Barrier,
}

#[async_trait]
impl Storage for RacingStore {
    async fn get(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        let entity = self.inner.get(entity_id).await?;
        self.barrier.wait().await;
        Ok(entity)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entity>, StoreError> {
        self.inner.find_by_email(email).await
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        self.inner.insert(entity).await
    }

    async fn put_if_version(
        &self,
        entity: &Entity,
        expected: Version,
    ) -> Result<PutOutcome, StoreError> {
        self.inner.put_if_version(entity, expected).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.inner.append_audit(record).await
    }

    async fn get_audit(&self, audit_id: &Uuid) -> Result<Option<AuditRecord>, StoreError> {
        self.inner.get_audit(audit_id).await
    }

    async fn list_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        self.inner.list_audit(entity_id).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_replace_bumps_version_and_records_inverse() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());

    let outcome = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"replace","path":"/status","value":"suspended"}]"#,
            &CorrelationId::from("req-1"),
        )
        .await
        .expect("patch");

    assert_eq!(outcome.new_version.to_string(), "v2");
    assert_matches!(outcome.audit, AuditStatus::Recorded(_));

    let stored = store.get("u1").await.expect("get").expect("exists");
    assert_eq!(stored.field_str("status"), Some("suspended"));
    assert_eq!(stored.version, outcome.new_version);

    let records = store.list_audit("u1").await.expect("list");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.correlation_id.as_str(), "req-1");
    assert_eq!(record.pre_version.to_string(), "v1");
    assert_eq!(record.post_version.to_string(), "v2");
    assert_eq!(
        record.forward_patch.to_json(),
        json!([{"op": "replace", "path": "/status", "value": "suspended"}])
    );
    assert_eq!(
        record.inverse_patch.to_json(),
        json!([{"op": "replace", "path": "/status", "value": "active"}])
    );
}

#[tokio::test]
async fn test_immutable_id_is_rejected_without_side_effects() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());

    let err = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"replace","path":"/id","value":"u2"}]"#,
            &CorrelationId::from("req-2"),
        )
        .await
        .expect_err("id is immutable");

    assert_eq!(err.kind(), ErrorKind::PatchAttributeNotRecognised);
    assert_eq!(err.details().attribute.as_deref(), Some("id"));
    assert_eq!(err.details().entity_id.as_deref(), Some("u1"));
    assert_eq!(err.details().correlation_id.as_deref(), Some("req-2"));

    assert_eq!(store.get("u1").await.expect("get"), Some(user_u1()));
    assert_eq!(store.audit_count().await, 0);
}

#[tokio::test]
async fn test_absent_entity_is_reported_before_validation() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(store.clone());

    // Malformed patch: still reported as a missing entity.
    let err = orchestrator
        .apply_patch("ghost", b"not json", &CorrelationId::from("req-3"))
        .await
        .expect_err("absent");

    assert_matches!(err, PatchError::ObjectDoesNotExist { .. });
    assert_eq!(err.details().entity_id.as_deref(), Some("ghost"));
    assert_eq!(err.details().correlation_id.as_deref(), Some("req-3"));
    assert_eq!(err.category().status_code(), 404);
}

#[tokio::test]
async fn test_unsupported_verb_and_unknown_field() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());
    let correlation = CorrelationId::from("req-4");

    let err = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"merge","path":"/status","value":"active"}]"#,
            &correlation,
        )
        .await
        .expect_err("merge");
    assert_eq!(err.kind(), ErrorKind::PatchOperationNotSupported);
    assert_eq!(err.details().operation.as_deref(), Some("merge"));

    let err = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"add","path":"/nickname","value":"gh"}]"#,
            &correlation,
        )
        .await
        .expect_err("unknown attribute");
    assert_eq!(err.kind(), ErrorKind::PatchAttributeNotRecognised);
    assert_eq!(err.details().attribute.as_deref(), Some("nickname"));

    let err = orchestrator
        .apply_patch("u1", br#"{"op":"add"}"#, &correlation)
        .await
        .expect_err("not an array");
    assert_eq!(err.kind(), ErrorKind::PatchInvalidJson);

    assert_eq!(store.audit_count().await, 0);
}

#[tokio::test]
async fn test_failed_test_operation_is_a_value_mismatch() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());

    let err = orchestrator
        .apply_patch(
            "u1",
            br#"[
                {"op":"test","path":"/status","value":"suspended"},
                {"op":"replace","path":"/status","value":"deactivated"}
            ]"#,
            &CorrelationId::from("req-5"),
        )
        .await
        .expect_err("test fails");

    assert_eq!(err.kind(), ErrorKind::PatchValueMismatch);
    assert_eq!(err.details().op_index, Some(0));
    assert_eq!(store.get("u1").await.expect("get"), Some(user_u1()));
}

#[tokio::test]
async fn test_audit_retries_transient_failures_without_duplicates() {
    let store = Arc::new(FlakyAuditStore::new(3));
    let orchestrator = orchestrator(store.clone());

    let outcome = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"replace","path":"/status","value":"suspended"}]"#,
            &CorrelationId::from("req-6"),
        )
        .await
        .expect("patch");

    assert_matches!(outcome.audit, AuditStatus::Recorded(_));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 4);

    let records = store.list_audit("u1").await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].audit_id, outcome.audit.audit_id());
}

#[tokio::test]
async fn test_persistent_audit_failure_leaves_change_committed() {
    let store = Arc::new(FlakyAuditStore::new(u32::MAX));
    let orchestrator = orchestrator(store.clone());

    let outcome = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"replace","path":"/status","value":"suspended"}]"#,
            &CorrelationId::from("req-7"),
        )
        .await
        .expect("entity change still succeeds");

    assert_matches!(outcome.audit, AuditStatus::Pending { .. });
    // First attempt plus three retries.
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 4);

    let stored = store.get("u1").await.expect("get").expect("exists");
    assert_eq!(stored.version.to_string(), "v2");
    assert!(store.list_audit("u1").await.expect("list").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writers_commit_exactly_once() {
    const WRITERS: usize = 8;
    let store = Arc::new(RacingStore {
        inner: MemoryStore::with_entities([user_u1()]),
        barrier: Barrier::new(WRITERS),
    });
    let orchestrator = Arc::new(orchestrator(store.clone()));

    let mut handles = Vec::with_capacity(WRITERS);
    for i in 0..WRITERS {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let patch = format!(r#"[{{"op":"replace","path":"/first_name","value":"w{i}"}}]"#);
            orchestrator
                .apply_patch("u1", patch.as_bytes(), &CorrelationId::from(format!("w{i}")))
                .await
        }));
    }

    let mut committed = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(outcome) => {
                committed += 1;
                assert_eq!(outcome.new_version.to_string(), "v2");
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::ConcurrencyConflict);
                assert_eq!(e.details().expected_version.as_deref(), Some("v1"));
                conflicts += 1;
            }
        }
    }

    assert_eq!(committed, 1);
    assert_eq!(conflicts, WRITERS - 1);
    assert_eq!(store.inner.audit_count().await, 1);
}

#[tokio::test]
async fn test_inverse_restores_pre_state() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());
    let pre = user_u1().fields;

    let outcome = orchestrator
        .apply_patch(
            "u1",
            br#"[
                {"op":"add","path":"/title","value":"Rear Admiral"},
                {"op":"move","from":"/first_name","path":"/last_name"},
                {"op":"copy","from":"/email","path":"/crm_id"},
                {"op":"remove","path":"/title"},
                {"op":"replace","path":"/status","value":"suspended"}
            ]"#,
            &CorrelationId::from("req-8"),
        )
        .await
        .expect("patch");

    let record = store
        .get_audit(&outcome.audit.audit_id())
        .await
        .expect("get audit")
        .expect("recorded");
    let inverse = validate_document(&EntitySchema::user(), &record.inverse_patch).expect("valid");
    let restored: Map<String, Value> = apply(&outcome.entity.fields, &inverse).expect("apply");
    assert_eq!(restored, pre);
}

#[tokio::test]
async fn test_revert_undoes_change_and_records_itself() {
    let store = Arc::new(MemoryStore::with_entities([user_u1()]));
    let orchestrator = orchestrator(store.clone());
    let correlation = CorrelationId::from("req-9");

    let change = orchestrator
        .apply_patch(
            "u1",
            br#"[{"op":"add","path":"/country_code","value":"GB"},
                {"op":"replace","path":"/status","value":"suspended"}]"#,
            &correlation,
        )
        .await
        .expect("patch");

    let undo = orchestrator
        .revert(&change.audit.audit_id(), &correlation)
        .await
        .expect("revert");

    assert_eq!(undo.new_version.to_string(), "v3");
    assert_eq!(undo.entity.fields, user_u1().fields);

    let history = orchestrator.history("u1").await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].reverts, Some(change.audit.audit_id()));
    assert_eq!(history[1].forward_patch, history[0].inverse_patch);

    let err = orchestrator
        .revert(&Uuid::new_v4(), &correlation)
        .await
        .expect_err("unknown audit id");
    assert_eq!(err.kind(), ErrorKind::ObjectDoesNotExist);
    assert!(err.details().audit_id.is_some());
}
