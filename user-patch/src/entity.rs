//! User entity, version token and field schema

use crate::config::SchemaConfig;
use crate::errors::{PatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Optimistic concurrency token, rendered as `v1`, `v2`, …
///
/// Callers treat it as opaque; only storage and the orchestrator look inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(u64);

impl Version {
    /// Version assigned at creation
    pub const INITIAL: Version = Version(1);

    pub fn from_u64(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Token the next committed write will carry
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.strip_prefix('v')
            .and_then(|n| n.parse::<u64>().ok())
            .map(Self)
            .ok_or_else(|| format!("invalid version token '{s}'"))
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// Opaque request token threaded through logs, errors and audit records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random correlation id, for callers that did not supply one
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored user record.
///
/// System attributes sit beside the mutable `fields`; on the wire they are
/// flattened into a single JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub version: Version,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Build a freshly created entity at [`Version::INITIAL`]
    pub fn new(id: impl Into<String>, fields: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created: now,
            modified: now,
            version: Version::INITIAL,
            fields,
        }
    }

    /// The entity as it will look after a committed patch
    pub fn successor(&self, fields: Map<String, Value>, modified: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            created: self.created,
            modified,
            version: self.version.next(),
            fields,
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Which fields a patch may touch, and which values some of them accept.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    mutable: BTreeSet<String>,
    immutable: BTreeSet<String>,
    required: BTreeSet<String>,
    allowed_values: BTreeMap<String, Vec<Value>>,
}

impl EntitySchema {
    pub fn new<M, I>(mutable: M, immutable: I) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            mutable: mutable.into_iter().map(Into::into).collect(),
            immutable: immutable.into_iter().map(Into::into).collect(),
            required: BTreeSet::new(),
            allowed_values: BTreeMap::new(),
        }
    }

    /// Fields that must always hold a non-empty string
    pub fn with_required<R>(mut self, fields: R) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
    {
        self.required.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Restrict `field` to a fixed vocabulary
    pub fn with_allowed_values<V>(mut self, field: &str, values: V) -> Self
    where
        V: IntoIterator,
        V::Item: Into<Value>,
    {
        self.allowed_values
            .insert(field.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_config(cfg: &SchemaConfig) -> Self {
        let schema = Self::new(cfg.mutable_fields.clone(), cfg.immutable_fields.clone())
            .with_required(cfg.required_fields.clone());
        if cfg.allowed_statuses.is_empty() {
            schema
        } else {
            schema.with_allowed_values("status", cfg.allowed_statuses.clone())
        }
    }

    /// Default schema for user records
    pub fn user() -> Self {
        Self::from_config(&SchemaConfig::default())
    }

    /// Whether a patch may target `field`.
    ///
    /// System fields are never patchable, even when listed as mutable.
    pub fn is_mutable(&self, field: &str) -> bool {
        self.mutable.contains(field) && !self.immutable.contains(field)
    }

    pub fn mutable_fields(&self) -> impl Iterator<Item = &str> {
        self.mutable.iter().map(String::as_str)
    }

    /// Check required fields and every constrained field present in `fields`
    pub fn check_values(&self, fields: &Map<String, Value>) -> Result<()> {
        for field in &self.required {
            match fields.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(value) => {
                    return Err(PatchError::invalid_value(
                        field,
                        format!("'{field}' must be a non-empty string, got {value}"),
                    ));
                }
                None => {
                    return Err(PatchError::invalid_value(
                        field,
                        format!("'{field}' is required"),
                    ));
                }
            }
        }
        for (field, allowed) in &self.allowed_values {
            if let Some(value) = fields.get(field)
                && !allowed.contains(value)
            {
                return Err(PatchError::invalid_value(
                    field,
                    format!("value {value} is not allowed for '{field}'"),
                ));
            }
        }
        Ok(())
    }

    /// Reject fields outside the mutable set (used on creation)
    pub fn check_fields(&self, fields: &Map<String, Value>) -> Result<()> {
        if let Some(unknown) = fields.keys().find(|k| !self.is_mutable(k)) {
            return Err(PatchError::invalid_value(
                unknown,
                format!("attribute '{unknown}' not recognised"),
            ));
        }
        self.check_values(fields)
    }
}
