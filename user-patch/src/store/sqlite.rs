//! SQLite storage backend
//!
//! Connections come from an r2d2 pool and every call runs on the blocking
//! thread pool via `spawn_blocking`, so a caller's timeout can fire while
//! SQLite is still waiting on a lock.

use super::{PutOutcome, Storage, StoreError};
use crate::audit::AuditRecord;
use crate::entity::{CorrelationId, Entity, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use std::path::Path;
use uuid::Uuid;

/// Embedded schema SQL
const SCHEMA_SQL: &str = include_str!("../../USER_PATCH_SCHEMA.sql");

/// Pool size for file-backed databases
const DEFAULT_POOL_SIZE: u32 = 4;

/// Raw `users` row before decoding
type UserRow = (String, String, String, String, i64);

/// Raw `user_audit` row before decoding
type AuditRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
);

const USER_COLUMNS: &str = "id, fields_json, created, modified, version";

const AUDIT_COLUMNS: &str = "audit_id, entity_id, correlation_id, recorded_at, forward_patch, \
     inverse_patch, pre_version, post_version, reverts";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let store = Self::from_manager(SqliteConnectionManager::file(path), DEFAULT_POOL_SIZE)?;
        tracing::debug!(path = %path.display(), "user store initialized");
        Ok(store)
    }

    /// In-memory database (for tests and dry runs).
    ///
    /// Each in-memory connection is its own database, so the pool holds one.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_manager(SqliteConnectionManager::memory(), 1)
    }

    fn from_manager(manager: SqliteConnectionManager, size: u32) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(size)
            .build(manager)
            .map_err(|e| StoreError::Unavailable(format!("failed to build connection pool: {e}")))?;

        let conn = pool
            .get()
            .map_err(|e| StoreError::Unavailable(format!("failed to get connection: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::database("failed to apply schema", e))?;
        drop(conn);

        Ok(Self { pool })
    }

    /// Run a sync database operation on the blocking pool
    async fn with_connection<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(format!("failed to get connection: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(format!("storage task join error: {e}")))?
    }
}

fn query_user(conn: &Connection, clause: &str, key: &str) -> Result<Option<Entity>, StoreError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause} = ?1");
    let row: Option<UserRow> = conn
        .query_row(&sql, params![key], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .optional()
        .map_err(|e| StoreError::database("failed to get user", e))?;

    row.map(decode_user).transpose()
}

fn version_of(conn: &Connection, entity_id: &str) -> Result<Option<Version>, StoreError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM users WHERE id = ?1",
            params![entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::database("failed to read version", e))?;
    Ok(version.map(|v| Version::from_u64(v as u64)))
}

fn email_owner(conn: &Connection, email: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT id FROM users WHERE email = ?1",
        params![email],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| StoreError::database("failed to look up email", e))
}

/// Map a failed write, turning unique-constraint hits into `Duplicate`
fn write_error(message: &str, entity: &Entity, e: rusqlite::Error) -> StoreError {
    if e.sqlite_error_code() != Some(rusqlite::ErrorCode::ConstraintViolation) {
        return StoreError::database(message, e);
    }
    match entity.field_str("email") {
        Some(email) if e.to_string().contains("users.email") => StoreError::Duplicate {
            field: "email".to_string(),
            value: email.to_string(),
        },
        _ => StoreError::Duplicate {
            field: "id".to_string(),
            value: entity.id.clone(),
        },
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn decode_user(row: UserRow) -> Result<Entity, StoreError> {
    let (id, fields_json, created, modified, version) = row;
    let fields: Map<String, Value> = serde_json::from_str(&fields_json)
        .map_err(|e| StoreError::Corrupt(format!("fields of user {id}: {e}")))?;
    Ok(Entity {
        created: parse_time(&created)?,
        modified: parse_time(&modified)?,
        version: Version::from_u64(version as u64),
        fields,
        id,
    })
}

fn decode_audit(row: AuditRow) -> Result<AuditRecord, StoreError> {
    let (audit_id, entity_id, correlation_id, recorded_at, forward, inverse, pre, post, reverts) =
        row;
    let parse_uuid = |s: &str| {
        Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad audit id '{s}': {e}")))
    };
    let parse_patch = |s: &str| {
        serde_json::from_str(s)
            .map_err(|e| StoreError::Corrupt(format!("patch of audit {audit_id}: {e}")))
    };

    Ok(AuditRecord {
        audit_id: parse_uuid(&audit_id)?,
        entity_id,
        correlation_id: CorrelationId::from(correlation_id),
        recorded_at: parse_time(&recorded_at)?,
        forward_patch: parse_patch(&forward)?,
        inverse_patch: parse_patch(&inverse)?,
        pre_version: Version::from_u64(pre as u64),
        post_version: Version::from_u64(post as u64),
        reverts: reverts.as_deref().map(parse_uuid).transpose()?,
    })
}

fn audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn encode_fields(entity: &Entity) -> Result<String, StoreError> {
    serde_json::to_string(&entity.fields)
        .map_err(|e| StoreError::Corrupt(format!("fields of user {}: {e}", entity.id)))
}

#[async_trait]
impl Storage for SqliteStore {
    async fn get(&self, entity_id: &str) -> Result<Option<Entity>, StoreError> {
        let entity_id = entity_id.to_string();
        self.with_connection(move |conn| query_user(conn, "id", &entity_id))
            .await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entity>, StoreError> {
        let email = email.to_string();
        self.with_connection(move |conn| query_user(conn, "email", &email))
            .await
    }

    async fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        let entity = entity.clone();
        self.with_connection(move |conn| {
            if version_of(conn, &entity.id)?.is_some() {
                return Err(StoreError::Duplicate {
                    field: "id".to_string(),
                    value: entity.id.clone(),
                });
            }
            let email = entity.field_str("email");
            if let Some(email) = email
                && email_owner(conn, email)?.is_some()
            {
                return Err(StoreError::Duplicate {
                    field: "email".to_string(),
                    value: email.to_string(),
                });
            }

            conn.execute(
                r#"
                INSERT INTO users (id, email, fields_json, created, modified, version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entity.id,
                    email,
                    encode_fields(&entity)?,
                    entity.created.to_rfc3339(),
                    entity.modified.to_rfc3339(),
                    entity.version.as_u64() as i64,
                ],
            )
            .map_err(|e| write_error("failed to insert user", &entity, e))?;

            tracing::debug!(entity_id = %entity.id, "inserted user");
            Ok(())
        })
        .await
    }

    async fn put_if_version(
        &self,
        entity: &Entity,
        expected: Version,
    ) -> Result<PutOutcome, StoreError> {
        let entity = entity.clone();
        self.with_connection(move |conn| {
            let email = entity.field_str("email");
            if let Some(email) = email
                && let Some(owner) = email_owner(conn, email)?
                && owner != entity.id
            {
                return Err(StoreError::Duplicate {
                    field: "email".to_string(),
                    value: email.to_string(),
                });
            }

            let updated = conn
                .execute(
                    r#"
                    UPDATE users
                    SET email = ?2,
                        fields_json = ?3,
                        modified = ?4,
                        version = ?5
                    WHERE id = ?1 AND version = ?6
                    "#,
                    params![
                        entity.id,
                        email,
                        encode_fields(&entity)?,
                        entity.modified.to_rfc3339(),
                        entity.version.as_u64() as i64,
                        expected.as_u64() as i64,
                    ],
                )
                .map_err(|e| write_error("failed to update user", &entity, e))?;

            if updated == 1 {
                return Ok(PutOutcome::Committed);
            }
            Ok(PutOutcome::VersionConflict {
                current: version_of(conn, &entity.id)?,
            })
        })
        .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let forward = serde_json::to_string(&record.forward_patch)
            .map_err(|e| StoreError::Corrupt(format!("forward patch: {e}")))?;
        let inverse = serde_json::to_string(&record.inverse_patch)
            .map_err(|e| StoreError::Corrupt(format!("inverse patch: {e}")))?;
        let record = record.clone();

        self.with_connection(move |conn| {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO user_audit
                    (audit_id, entity_id, correlation_id, recorded_at, forward_patch,
                     inverse_patch, pre_version, post_version, reverts)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    record.audit_id.to_string(),
                    record.entity_id,
                    record.correlation_id.as_str(),
                    record.recorded_at.to_rfc3339(),
                    forward,
                    inverse,
                    record.pre_version.as_u64() as i64,
                    record.post_version.as_u64() as i64,
                    record.reverts.map(|id| id.to_string()),
                ],
            )
            .map_err(|e| StoreError::database("failed to append audit record", e))?;
            Ok(())
        })
        .await
    }

    async fn get_audit(&self, audit_id: &Uuid) -> Result<Option<AuditRecord>, StoreError> {
        let audit_id = audit_id.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT {AUDIT_COLUMNS} FROM user_audit WHERE audit_id = ?1");
            let row = conn
                .query_row(&sql, params![audit_id], audit_row)
                .optional()
                .map_err(|e| StoreError::database("failed to get audit record", e))?;
            row.map(decode_audit).transpose()
        })
        .await
    }

    async fn list_audit(&self, entity_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        let entity_id = entity_id.to_string();
        self.with_connection(move |conn| {
            let sql = format!(
                "SELECT {AUDIT_COLUMNS} FROM user_audit WHERE entity_id = ?1 ORDER BY post_version ASC"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::database("failed to prepare query", e))?;

            let rows = stmt
                .query_map(params![entity_id], audit_row)
                .map_err(|e| StoreError::database("failed to query audit records", e))?;

            let mut records = Vec::new();
            for row in rows {
                let row = row.map_err(|e| StoreError::database("failed to read audit row", e))?;
                records.push(decode_audit(row)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditInput;
    use crate::patch::{PatchDocument, PatchOperation, Pointer};
    use crate::store::with_timeout;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn user(id: &str, email: &str) -> Entity {
        let mut fields = Map::new();
        fields.insert("email".to_string(), json!(email));
        fields.insert("status".to_string(), json!("active"));
        Entity::new(id, fields, Utc::now())
    }

    #[tokio::test]
    async fn test_user_crud() {
        let store = SqliteStore::open_in_memory().expect("open");
        let u1 = user("u1", "a@example.com");
        store.insert(&u1).await.expect("insert");

        let loaded = store.get("u1").await.expect("get").expect("exists");
        assert_eq!(loaded.fields, u1.fields);
        assert_eq!(loaded.version, Version::INITIAL);

        let by_email = store
            .find_by_email("a@example.com")
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(by_email.id, "u1");

        assert!(store.get("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = SqliteStore::open_in_memory().expect("open");
        let u1 = user("u1", "a@example.com");
        store.insert(&u1).await.expect("insert");

        let mut fields = u1.fields.clone();
        fields.insert("status".to_string(), json!("suspended"));
        let next = u1.successor(fields, Utc::now());

        assert_eq!(
            store.put_if_version(&next, u1.version).await.expect("put"),
            PutOutcome::Committed
        );
        assert_eq!(
            store.put_if_version(&next, u1.version).await.expect("put"),
            PutOutcome::VersionConflict {
                current: Some(next.version)
            }
        );

        let ghost = user("ghost", "g@example.com");
        assert_eq!(
            store
                .put_if_version(&ghost, Version::INITIAL)
                .await
                .expect("put"),
            PutOutcome::VersionConflict { current: None }
        );

        let loaded = store.get("u1").await.expect("get").expect("exists");
        assert_eq!(loaded.field_str("status"), Some("suspended"));
        assert_eq!(loaded.version.to_string(), "v2");
    }

    #[tokio::test]
    async fn test_email_stays_unique_across_updates() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.insert(&user("u1", "a@example.com")).await.expect("insert");
        let u2 = user("u2", "b@example.com");
        store.insert(&u2).await.expect("insert");

        let mut fields = u2.fields.clone();
        fields.insert("email".to_string(), json!("a@example.com"));
        let err = store
            .put_if_version(&u2.successor(fields, Utc::now()), u2.version)
            .await
            .expect_err("email taken");
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_audit_append_is_idempotent() {
        let store = SqliteStore::open_in_memory().expect("open");
        let record = AuditRecord::new(AuditInput {
            entity_id: "u1".to_string(),
            correlation_id: CorrelationId::from("c-1"),
            forward_patch: PatchDocument::new(vec![PatchOperation::Replace {
                path: Pointer::field("status"),
                value: json!("suspended"),
            }]),
            inverse_patch: PatchDocument::new(vec![PatchOperation::Replace {
                path: Pointer::field("status"),
                value: json!("active"),
            }]),
            pre_version: Version::INITIAL,
            post_version: Version::INITIAL.next(),
            timestamp: Utc::now(),
            reverts: None,
        });

        store.append_audit(&record).await.expect("append");
        store.append_audit(&record).await.expect("append again");

        let records = store.list_audit("u1").await.expect("list");
        assert_eq!(records.len(), 1);

        let loaded = store
            .get_audit(&record.audit_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(loaded.inverse_patch, record.inverse_patch);
        assert_eq!(loaded.post_version, record.post_version);
    }

    #[tokio::test]
    async fn test_locked_database_hits_caller_timeout() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("users.db");
        let store = SqliteStore::open(&path).expect("open");

        let blocker = Connection::open(&path).expect("second connection");
        blocker.execute_batch("BEGIN EXCLUSIVE;").expect("lock");

        let started = Instant::now();
        let result = with_timeout(
            Duration::from_millis(50),
            store.insert(&user("u1", "a@example.com")),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));

        // Let the abandoned blocking call finish before the runtime shuts down.
        blocker.execute_batch("COMMIT;").expect("unlock");
    }
}
