//! Ordered application of a validated patch to an entity snapshot

use super::document::PatchOperation;
use super::pointer::{Pointer, parse_index};
use super::validator::ValidatedPatch;
use crate::errors::{PatchError, Result};
use serde_json::{Map, Value};

/// What one operation did, as needed to undo it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StepEffect {
    /// Target path with any `-` array token resolved to a concrete index
    pub path: Pointer,
    /// Value that sat at `path` and was overwritten
    pub replaced: Option<Value>,
    /// Value taken out by `remove`, or carried by `move`
    pub removed: Option<Value>,
}

impl StepEffect {
    fn at(path: Pointer) -> Self {
        Self {
            path,
            replaced: None,
            removed: None,
        }
    }
}

/// Apply `patch` to `fields`, returning the new field map.
///
/// `fields` is left untouched; all work happens on a private copy.
pub fn apply(fields: &Map<String, Value>, patch: &ValidatedPatch) -> Result<Map<String, Value>> {
    let mut doc = Value::Object(fields.clone());
    for (index, op) in patch.document().iter().enumerate() {
        apply_step(&mut doc, op).map_err(|e| e.at_operation(index))?;
    }

    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(PatchError::internal("patched entity is no longer an object")),
    }
}

pub(crate) fn apply_step(doc: &mut Value, op: &PatchOperation) -> Result<StepEffect> {
    match op {
        PatchOperation::Add { path, value } => add(doc, path, value.clone()),
        PatchOperation::Remove { path } => {
            let removed = remove(doc, path)?;
            Ok(StepEffect {
                removed: Some(removed),
                ..StepEffect::at(path.clone())
            })
        }
        PatchOperation::Replace { path, value } => {
            let old = replace(doc, path, value.clone())?;
            Ok(StepEffect {
                replaced: Some(old),
                ..StepEffect::at(path.clone())
            })
        }
        PatchOperation::Move { from, path } => {
            if from == path {
                // Still has to exist.
                get(doc, from).ok_or_else(|| missing(from))?;
                return Ok(StepEffect::at(path.clone()));
            }
            if from.is_proper_prefix_of(path) {
                return Err(PatchError::value_mismatch(
                    &path.to_string(),
                    format!("cannot move '{from}' into its own child '{path}'"),
                ));
            }
            let moved = remove(doc, from)?;
            let effect = add(doc, path, moved.clone())?;
            Ok(StepEffect {
                removed: Some(moved),
                ..effect
            })
        }
        PatchOperation::Copy { from, path } => {
            let value = get(doc, from).cloned().ok_or_else(|| missing(from))?;
            add(doc, path, value)
        }
        PatchOperation::Test { path, value } => {
            let current = get(doc, path).ok_or_else(|| missing(path))?;
            if current != value {
                return Err(PatchError::value_mismatch(
                    &path.to_string(),
                    format!("test failed at '{path}': expected {value}, found {current}"),
                ));
            }
            Ok(StepEffect::at(path.clone()))
        }
    }
}

fn missing(path: &Pointer) -> PatchError {
    PatchError::value_mismatch(&path.to_string(), format!("no value at '{path}'"))
}

fn get<'a>(doc: &'a Value, path: &Pointer) -> Option<&'a Value> {
    path.tokens().iter().try_fold(doc, |node, token| match node {
        Value::Object(map) => map.get(token),
        Value::Array(items) => parse_index(token).and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Walk to the container holding the last token of `path`
fn parent_mut<'a>(doc: &'a mut Value, path: &Pointer) -> Result<(&'a mut Value, String)> {
    let Some((last, parents)) = path.tokens().split_last() else {
        return Err(PatchError::internal("patch targets the whole entity"));
    };

    let mut node = doc;
    for token in parents {
        node = match node {
            Value::Object(map) => map.get_mut(token),
            Value::Array(items) => parse_index(token).and_then(|i| items.get_mut(i)),
            _ => None,
        }
        .ok_or_else(|| missing(path))?;
    }
    Ok((node, last.clone()))
}

fn add(doc: &mut Value, path: &Pointer, value: Value) -> Result<StepEffect> {
    let (parent, token) = parent_mut(doc, path)?;
    match parent {
        Value::Object(map) => {
            let replaced = map.insert(token, value);
            Ok(StepEffect {
                replaced,
                ..StepEffect::at(path.clone())
            })
        }
        Value::Array(items) => {
            let index = if token == "-" {
                items.len()
            } else {
                parse_index(&token)
                    .filter(|i| *i <= items.len())
                    .ok_or_else(|| out_of_range(path))?
            };
            items.insert(index, value);
            Ok(StepEffect::at(path.with_last(index.to_string())))
        }
        _ => Err(missing(path)),
    }
}

fn remove(doc: &mut Value, path: &Pointer) -> Result<Value> {
    let (parent, token) = parent_mut(doc, path)?;
    match parent {
        Value::Object(map) => map.remove(&token).ok_or_else(|| missing(path)),
        Value::Array(items) => {
            let index = parse_index(&token)
                .filter(|i| *i < items.len())
                .ok_or_else(|| out_of_range(path))?;
            Ok(items.remove(index))
        }
        _ => Err(missing(path)),
    }
}

fn replace(doc: &mut Value, path: &Pointer, value: Value) -> Result<Value> {
    let (parent, token) = parent_mut(doc, path)?;
    let slot = match parent {
        Value::Object(map) => map.get_mut(&token),
        Value::Array(items) => parse_index(&token).and_then(|i| items.get_mut(i)),
        _ => None,
    }
    .ok_or_else(|| missing(path))?;
    Ok(std::mem::replace(slot, value))
}

fn out_of_range(path: &Pointer) -> PatchError {
    PatchError::value_mismatch(
        &path.to_string(),
        format!("array index out of range at '{path}'"),
    )
}
