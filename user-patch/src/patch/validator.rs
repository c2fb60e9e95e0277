//! Patch validation against the entity schema
//!
//! Two passes. The syntax pass turns raw bytes into operations and fails with
//! `PatchInvalidJson` on anything malformed. Only then does the semantic pass
//! check verbs and target fields, stopping at the first bad operation.

use super::document::{PatchDocument, PatchOperation, Verb};
use super::pointer::Pointer;
use crate::entity::EntitySchema;
use crate::errors::{PatchError, Result};
use serde_json::{Map, Value};

/// A patch document that passed [`validate`].
///
/// Only this module can build one, so the applier never sees an
/// unchecked document.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPatch(PatchDocument);

impl ValidatedPatch {
    pub fn document(&self) -> &PatchDocument {
        &self.0
    }

    pub fn into_document(self) -> PatchDocument {
        self.0
    }
}

/// Operation as it appears on the wire, before the verb is checked
struct RawOperation {
    op: String,
    path: Pointer,
    from: Option<Pointer>,
    value: Option<Value>,
}

/// Validate raw patch bytes against `schema`.
pub fn validate(schema: &EntitySchema, patch: &[u8]) -> Result<ValidatedPatch> {
    let raw = parse_raw(patch)?;

    let mut operations = Vec::with_capacity(raw.len());
    for (index, op) in raw.into_iter().enumerate() {
        operations.push(check_operation(schema, op).map_err(|e| e.at_operation(index))?);
    }
    Ok(ValidatedPatch(PatchDocument::new(operations)))
}

/// Validate an already-typed document, e.g. an inverse patch being replayed.
pub fn validate_document(schema: &EntitySchema, document: &PatchDocument) -> Result<ValidatedPatch> {
    for (index, op) in document.iter().enumerate() {
        check_target(schema, op.path()).map_err(|e| e.at_operation(index))?;
        if let Some(from) = op.from() {
            check_target(schema, from).map_err(|e| e.at_operation(index))?;
        }
    }
    Ok(ValidatedPatch(document.clone()))
}

fn parse_raw(patch: &[u8]) -> Result<Vec<RawOperation>> {
    let value: Value = serde_json::from_slice(patch)
        .map_err(|e| PatchError::invalid_json(format!("patch is not valid JSON: {e}")))?;

    let Value::Array(items) = value else {
        return Err(PatchError::invalid_json(
            "patch must be an array of operation objects",
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| parse_raw_operation(item).map_err(|e| e.at_operation(index)))
        .collect()
}

fn parse_raw_operation(item: Value) -> Result<RawOperation> {
    let Value::Object(mut obj) = item else {
        return Err(PatchError::invalid_json("operation must be a JSON object"));
    };

    let op = match obj.remove("op") {
        Some(Value::String(op)) => op,
        Some(_) => return Err(PatchError::invalid_json("member 'op' must be a string")),
        None => return Err(PatchError::invalid_json("operation is missing member 'op'")),
    };
    let path = pointer_member(&mut obj, "path")?
        .ok_or_else(|| PatchError::invalid_json("operation is missing member 'path'"))?;

    // Unknown verbs are a semantic failure, reported by the second pass.
    // Members a verb does not define are ignored.
    let verb = Verb::parse(&op);
    let from = match verb {
        Some(verb) if verb.requires_from() => pointer_member(&mut obj, "from")?,
        _ => None,
    };
    let value = match verb {
        Some(verb) if !verb.requires_value() => None,
        _ => obj.remove("value"),
    };

    if let Some(verb) = verb {
        if verb.requires_value() && value.is_none() {
            return Err(PatchError::invalid_json(format!(
                "'{verb}' operation is missing member 'value'"
            )));
        }
        if verb.requires_from() && from.is_none() {
            return Err(PatchError::invalid_json(format!(
                "'{verb}' operation is missing member 'from'"
            )));
        }
    }

    Ok(RawOperation {
        op,
        path,
        from,
        value,
    })
}

fn pointer_member(obj: &mut Map<String, Value>, key: &str) -> Result<Option<Pointer>> {
    match obj.remove(key) {
        None => Ok(None),
        Some(Value::String(s)) => Pointer::parse(&s)
            .map(Some)
            .map_err(|e| PatchError::invalid_json(format!("member '{key}': {e}"))),
        Some(_) => Err(PatchError::invalid_json(format!(
            "member '{key}' must be a string"
        ))),
    }
}

fn check_operation(schema: &EntitySchema, raw: RawOperation) -> Result<PatchOperation> {
    let verb = Verb::parse(&raw.op).ok_or_else(|| PatchError::operation_not_supported(&raw.op))?;

    check_target(schema, &raw.path)?;
    if verb.requires_from()
        && let Some(from) = &raw.from
    {
        check_target(schema, from)?;
    }

    let RawOperation {
        path, from, value, ..
    } = raw;
    // Presence of `value`/`from` was checked in the syntax pass.
    let missing = || PatchError::internal(format!("'{verb}' operation lost a required member"));
    let op = match verb {
        Verb::Add => PatchOperation::Add {
            path,
            value: value.ok_or_else(missing)?,
        },
        Verb::Remove => PatchOperation::Remove { path },
        Verb::Replace => PatchOperation::Replace {
            path,
            value: value.ok_or_else(missing)?,
        },
        Verb::Move => PatchOperation::Move {
            from: from.ok_or_else(missing)?,
            path,
        },
        Verb::Copy => PatchOperation::Copy {
            from: from.ok_or_else(missing)?,
            path,
        },
        Verb::Test => PatchOperation::Test {
            path,
            value: value.ok_or_else(missing)?,
        },
    };
    Ok(op)
}

fn check_target(schema: &EntitySchema, pointer: &Pointer) -> Result<()> {
    match pointer.root_field() {
        Some(field) if schema.is_mutable(field) => Ok(()),
        Some(field) => Err(PatchError::attribute_not_recognised(field)),
        None => Err(PatchError::attribute_not_recognised("")),
    }
}
