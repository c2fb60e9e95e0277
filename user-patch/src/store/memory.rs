//! In-process storage backend

use super::{PutOutcome, Storage, StoreError};
use crate::audit::AuditRecord;
use crate::entity::{Entity, Version};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    entities: HashMap<String, Entity>,
    audit: Vec<AuditRecord>,
}

/// Entities and audit records held in memory behind one async mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entities`
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let inner = Inner {
            entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
            audit: Vec::new(),
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn audit_count(&self) -> usize {
        self.inner.lock().await.audit.len()
    }
}

fn email_of(entity: &Entity) -> Option<&str> {
    entity.field_str("email")
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        Ok(self.inner.lock().await.entities.get(entity_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entity>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entities
            .values()
            .find(|e| email_of(e) == Some(email))
            .cloned())
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.entities.contains_key(&entity.id) {
            return Err(StoreError::Duplicate {
                field: "id".to_string(),
                value: entity.id.clone(),
            });
        }
        if let Some(email) = email_of(entity)
            && inner.entities.values().any(|e| email_of(e) == Some(email))
        {
            return Err(StoreError::Duplicate {
                field: "email".to_string(),
                value: email.to_string(),
            });
        }
        inner.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn put_if_version(
        &self,
        entity: &Entity,
        expected: Version,
    ) -> Result<PutOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = match inner.entities.get(&entity.id) {
            None => return Ok(PutOutcome::VersionConflict { current: None }),
            Some(current) => current.version,
        };
        if current != expected {
            return Ok(PutOutcome::VersionConflict {
                current: Some(current),
            });
        }
        if let Some(email) = email_of(entity)
            && inner
                .entities
                .values()
                .any(|e| e.id != entity.id && email_of(e) == Some(email))
        {
            return Err(StoreError::Duplicate {
                field: "email".to_string(),
                value: email.to_string(),
            });
        }
        inner.entities.insert(entity.id.clone(), entity.clone());
        Ok(PutOutcome::Committed)
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.audit.iter().any(|r| r.audit_id == record.audit_id) {
            inner.audit.push(record.clone());
        }
        Ok(())
    }

    async fn get_audit(&self, audit_id: &Uuid) -> Result<Option<AuditRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.audit.iter().find(|r| &r.audit_id == audit_id).cloned())
    }

    async fn list_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<AuditRecord> = inner
            .audit
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.post_version);
        Ok(records)
    }
}
