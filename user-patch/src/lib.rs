//! JSON Patch engine for user records
//!
//! Applies RFC 6902 patch documents to stored user entities under
//! optimistic concurrency, and records every committed change together
//! with the inverse patch that undoes it.
//!
//! The pipeline for one request:
//! - fetch the entity (absent entities are rejected before validation)
//! - validate the patch against the mutable-attribute schema
//! - apply it to a private copy and build the inverse
//! - conditionally write the new entity on the fetched version
//! - append the audit record, retrying transient storage failures

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod entity;
pub mod errors;
pub mod orchestrator;
pub mod patch;
pub mod retry;
pub mod service;
pub mod store;

pub use audit::{AuditInput, AuditRecord, AuditRecorder};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PatchEngineConfig;
pub use entity::{CorrelationId, Entity, EntitySchema, Version};
pub use errors::{ErrorCategory, ErrorDetails, ErrorKind, PatchError, Result};
pub use orchestrator::{AuditStatus, PatchOutcome, PatchStage, UpdateOrchestrator};
pub use patch::{PatchDocument, PatchOperation, Pointer, ValidatedPatch};
pub use service::{ServiceResponse, UserService};
pub use store::{MemoryStore, PutOutcome, SqliteStore, Storage, StoreError};
