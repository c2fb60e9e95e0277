//! User service facade
//!
//! The request-handling surface over the orchestrator: lookups, creation,
//! patching, history and revert, plus the mapping of results onto
//! status-coded JSON responses.

use crate::audit::AuditRecord;
use crate::clock::Clock;
use crate::config::PatchEngineConfig;
use crate::entity::{CorrelationId, Entity, EntitySchema};
use crate::errors::{PatchError, Result};
use crate::orchestrator::{AuditStatus, PatchOutcome, UpdateOrchestrator, store_error};
use crate::store::{Storage, with_timeout};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Status code plus JSON body, as handed back to a caller
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub status_code: u16,
    pub body: Value,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    fn from_error(error: &PatchError) -> Self {
        Self {
            status_code: error.category().status_code(),
            body: error.response_body(),
        }
    }
}

pub struct UserService {
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    orchestrator: UpdateOrchestrator,
    storage_timeout: Duration,
}

impl UserService {
    pub fn new(store: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: &PatchEngineConfig) -> Self {
        let schema = EntitySchema::from_config(&config.schema);
        let orchestrator = UpdateOrchestrator::new(store.clone(), clock.clone(), schema, config);
        Self {
            store,
            clock,
            orchestrator,
            storage_timeout: config.storage_timeout(),
        }
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator {
        &self.orchestrator
    }

    pub async fn get_user_by_id(&self, entity_id: &str) -> Result<Entity> {
        with_timeout(self.storage_timeout, self.store.get(entity_id))
            .await
            .map_err(|e| store_error("failed to fetch user", e).with_entity(entity_id))?
            .ok_or_else(|| PatchError::object_does_not_exist(entity_id))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Entity> {
        with_timeout(self.storage_timeout, self.store.find_by_email(email))
            .await
            .map_err(|e| store_error("failed to look up user by email", e))?
            .ok_or_else(|| PatchError::email_does_not_exist(email))
    }

    /// Create a user from its mutable fields; `email` is required and
    /// must be unused.
    pub async fn create_user(
        &self,
        fields: Map<String, Value>,
        correlation_id: &CorrelationId,
    ) -> Result<Entity> {
        let result = self.insert_user(fields).await;
        if let Ok(entity) = &result {
            tracing::info!(
                entity_id = %entity.id,
                correlation_id = %correlation_id,
                "user created"
            );
        }
        result.map_err(|e| e.with_correlation(correlation_id.as_str()))
    }

    async fn insert_user(&self, fields: Map<String, Value>) -> Result<Entity> {
        self.orchestrator.schema().check_fields(&fields)?;

        let entity = Entity::new(Uuid::new_v4().to_string(), fields, self.clock.now());
        with_timeout(self.storage_timeout, self.store.insert(&entity))
            .await
            .map_err(|e| store_error("failed to insert user", e))?;
        Ok(entity)
    }

    pub async fn patch_user(
        &self,
        entity_id: &str,
        patch: &[u8],
        correlation_id: &CorrelationId,
    ) -> Result<PatchOutcome> {
        self.orchestrator
            .apply_patch(entity_id, patch, correlation_id)
            .await
    }

    pub async fn history(&self, entity_id: &str) -> Result<Vec<AuditRecord>> {
        self.orchestrator.history(entity_id).await
    }

    pub async fn revert(
        &self,
        audit_id: &Uuid,
        correlation_id: &CorrelationId,
    ) -> Result<PatchOutcome> {
        self.orchestrator.revert(audit_id, correlation_id).await
    }
}

/// Body returned for a committed patch or revert
pub fn outcome_body(outcome: &PatchOutcome) -> Value {
    let audit = match &outcome.audit {
        AuditStatus::Recorded(audit_id) => json!({
            "status": "recorded",
            "audit_id": audit_id,
        }),
        AuditStatus::Pending { audit_id, error } => json!({
            "status": "pending",
            "audit_id": audit_id,
            "error": error,
        }),
    };
    json!({
        "user": outcome.entity,
        "version": outcome.new_version,
        "audit": audit,
    })
}

/// Render `result` as a response and log the call's outcome.
///
/// `success_code` is used when `result` is `Ok`; errors take the status
/// code of their category.
pub fn respond<T: Serialize>(
    operation: &str,
    correlation_id: &CorrelationId,
    started: Instant,
    result: Result<T>,
    success_code: u16,
) -> ServiceResponse {
    let response = match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(body) => ServiceResponse {
                status_code: success_code,
                body,
            },
            Err(e) => ServiceResponse::from_error(
                &PatchError::internal(format!("failed to serialize response: {e}"))
                    .with_correlation(correlation_id.as_str()),
            ),
        },
        Err(e) => ServiceResponse::from_error(&e),
    };

    tracing::info!(
        operation,
        correlation_id = %correlation_id,
        status_code = response.status_code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "API response"
    );
    response
}
