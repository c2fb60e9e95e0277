//! Patch engine error types
//!
//! Every failure a caller can observe maps to one [`ErrorKind`] and one
//! [`ErrorCategory`]. Callers switch on the kind; the category decides the
//! status code and whether a retry makes sense.

use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

/// Error category for structured logging and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The target entity (or audit record) does not exist
    NotFound,
    /// The request itself is wrong; resending it unchanged will fail again
    MalformedRequest,
    /// The request was well formed but conflicts with current state
    LogicalConflict,
    /// Storage failed or timed out
    TransientInfrastructure,
    /// Invariant violation inside the engine
    Internal,
}

impl ErrorCategory {
    /// Machine-readable code for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::LogicalConflict => "LOGICAL_CONFLICT",
            Self::TransientInfrastructure => "TRANSIENT_INFRASTRUCTURE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// HTTP-style status code used by the request-handling layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::MalformedRequest => 400,
            Self::LogicalConflict => 409,
            Self::TransientInfrastructure => 503,
            Self::Internal => 500,
        }
    }

    /// Whether the caller may reasonably retry (after re-reading state)
    pub fn client_retryable(&self) -> bool {
        matches!(self, Self::LogicalConflict | Self::TransientInfrastructure)
    }
}

/// Discriminant of [`PatchError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ObjectDoesNotExist,
    PatchAttributeNotRecognised,
    PatchOperationNotSupported,
    PatchInvalidJson,
    PatchValueMismatch,
    InvalidValue,
    DuplicateInsert,
    ConcurrencyConflict,
    Storage,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectDoesNotExist => "ObjectDoesNotExist",
            Self::PatchAttributeNotRecognised => "PatchAttributeNotRecognised",
            Self::PatchOperationNotSupported => "PatchOperationNotSupported",
            Self::PatchInvalidJson => "PatchInvalidJson",
            Self::PatchValueMismatch => "PatchValueMismatch",
            Self::InvalidValue => "InvalidValue",
            Self::DuplicateInsert => "DuplicateInsert",
            Self::ConcurrencyConflict => "ConcurrencyConflict",
            Self::Storage => "Storage",
            Self::Config => "Config",
            Self::Internal => "Internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ObjectDoesNotExist => ErrorCategory::NotFound,
            Self::PatchAttributeNotRecognised
            | Self::PatchOperationNotSupported
            | Self::PatchInvalidJson
            | Self::InvalidValue => ErrorCategory::MalformedRequest,
            Self::PatchValueMismatch | Self::DuplicateInsert | Self::ConcurrencyConflict => {
                ErrorCategory::LogicalConflict
            }
            Self::Storage => ErrorCategory::TransientInfrastructure,
            Self::Config | Self::Internal => ErrorCategory::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured payload carried by every error variant.
///
/// Only the members relevant to a failure are set; the rest are omitted
/// from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Position of the offending operation within the patch document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
}

/// Patch engine error
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{message}")]
    ObjectDoesNotExist {
        message: String,
        details: ErrorDetails,
    },

    #[error("{message}")]
    PatchAttributeNotRecognised {
        message: String,
        details: ErrorDetails,
    },

    #[error("{message}")]
    PatchOperationNotSupported {
        message: String,
        details: ErrorDetails,
    },

    #[error("invalid patch document: {message}")]
    PatchInvalidJson {
        message: String,
        details: ErrorDetails,
    },

    #[error("patch precondition failed: {message}")]
    PatchValueMismatch {
        message: String,
        details: ErrorDetails,
    },

    #[error("{message}")]
    InvalidValue {
        message: String,
        details: ErrorDetails,
    },

    #[error("{message}")]
    DuplicateInsert {
        message: String,
        details: ErrorDetails,
    },

    #[error("{message}")]
    ConcurrencyConflict {
        message: String,
        details: ErrorDetails,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        details: ErrorDetails,
        #[source]
        source: StoreError,
    },

    #[error("config error: {message}")]
    Config {
        message: String,
        details: ErrorDetails,
    },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: ErrorDetails,
    },
}

impl PatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectDoesNotExist { .. } => ErrorKind::ObjectDoesNotExist,
            Self::PatchAttributeNotRecognised { .. } => ErrorKind::PatchAttributeNotRecognised,
            Self::PatchOperationNotSupported { .. } => ErrorKind::PatchOperationNotSupported,
            Self::PatchInvalidJson { .. } => ErrorKind::PatchInvalidJson,
            Self::PatchValueMismatch { .. } => ErrorKind::PatchValueMismatch,
            Self::InvalidValue { .. } => ErrorKind::InvalidValue,
            Self::DuplicateInsert { .. } => ErrorKind::DuplicateInsert,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ObjectDoesNotExist { message, .. }
            | Self::PatchAttributeNotRecognised { message, .. }
            | Self::PatchOperationNotSupported { message, .. }
            | Self::PatchInvalidJson { message, .. }
            | Self::PatchValueMismatch { message, .. }
            | Self::InvalidValue { message, .. }
            | Self::DuplicateInsert { message, .. }
            | Self::ConcurrencyConflict { message, .. }
            | Self::Storage { message, .. }
            | Self::Config { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn details(&self) -> &ErrorDetails {
        match self {
            Self::ObjectDoesNotExist { details, .. }
            | Self::PatchAttributeNotRecognised { details, .. }
            | Self::PatchOperationNotSupported { details, .. }
            | Self::PatchInvalidJson { details, .. }
            | Self::PatchValueMismatch { details, .. }
            | Self::InvalidValue { details, .. }
            | Self::DuplicateInsert { details, .. }
            | Self::ConcurrencyConflict { details, .. }
            | Self::Storage { details, .. }
            | Self::Config { details, .. }
            | Self::Internal { details, .. } => details,
        }
    }

    fn details_mut(&mut self) -> &mut ErrorDetails {
        match self {
            Self::ObjectDoesNotExist { details, .. }
            | Self::PatchAttributeNotRecognised { details, .. }
            | Self::PatchOperationNotSupported { details, .. }
            | Self::PatchInvalidJson { details, .. }
            | Self::PatchValueMismatch { details, .. }
            | Self::InvalidValue { details, .. }
            | Self::DuplicateInsert { details, .. }
            | Self::ConcurrencyConflict { details, .. }
            | Self::Storage { details, .. }
            | Self::Config { details, .. }
            | Self::Internal { details, .. } => details,
        }
    }

    /// Attach the target entity id
    pub fn with_entity(mut self, entity_id: &str) -> Self {
        self.details_mut().entity_id = Some(entity_id.to_string());
        self
    }

    /// Attach the request correlation id
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.details_mut().correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Attach the position of the failing operation in its document
    pub fn at_operation(mut self, op_index: usize) -> Self {
        self.details_mut().op_index = Some(op_index);
        self
    }

    /// Body returned to the caller: message plus the structured details
    pub fn response_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind().as_str(),
            "message": self.message(),
            "details": self.details(),
            "correlation_id": self.details().correlation_id,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Entity missing for the given id
    pub fn object_does_not_exist(entity_id: &str) -> Self {
        Self::ObjectDoesNotExist {
            message: "user does not exist".to_string(),
            details: ErrorDetails {
                entity_id: Some(entity_id.to_string()),
                ..Default::default()
            },
        }
    }

    /// No user registered under the given email
    pub fn email_does_not_exist(email: &str) -> Self {
        Self::ObjectDoesNotExist {
            message: "user does not exist".to_string(),
            details: ErrorDetails {
                email: Some(email.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn audit_does_not_exist(audit_id: &str) -> Self {
        Self::ObjectDoesNotExist {
            message: "audit record does not exist".to_string(),
            details: ErrorDetails {
                audit_id: Some(audit_id.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn attribute_not_recognised(attribute: &str) -> Self {
        Self::PatchAttributeNotRecognised {
            message: format!("patch attribute '{attribute}' not recognised"),
            details: ErrorDetails {
                attribute: Some(attribute.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn operation_not_supported(operation: &str) -> Self {
        Self::PatchOperationNotSupported {
            message: format!("patch operation '{operation}' not supported"),
            details: ErrorDetails {
                operation: Some(operation.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::PatchInvalidJson {
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }

    pub fn value_mismatch(path: &str, message: impl Into<String>) -> Self {
        Self::PatchValueMismatch {
            message: message.into(),
            details: ErrorDetails {
                path: Some(path.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn invalid_value(attribute: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
            details: ErrorDetails {
                attribute: Some(attribute.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn duplicate_insert(message: impl Into<String>, details: ErrorDetails) -> Self {
        Self::DuplicateInsert {
            message: message.into(),
            details,
        }
    }

    pub fn concurrency_conflict(entity_id: &str, expected_version: &str) -> Self {
        Self::ConcurrencyConflict {
            message: "user was modified concurrently; re-read and retry".to_string(),
            details: ErrorDetails {
                entity_id: Some(entity_id.to_string()),
                expected_version: Some(expected_version.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn storage(message: impl Into<String>, source: StoreError) -> Self {
        Self::Storage {
            message: message.into(),
            details: ErrorDetails::default(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: ErrorDetails::default(),
        }
    }
}

/// Result type for patch engine operations
pub type Result<T> = std::result::Result<T, PatchError>;
