//! Undo patches
//!
//! The forward patch is replayed from the pre-state so each inverse step is
//! derived from the state that operation actually saw. Inverse steps are
//! emitted in reverse order, so replaying them against the post-state walks
//! back through every intermediate state to the pre-state.

use super::applier::{StepEffect, apply_step};
use super::document::{PatchDocument, PatchOperation};
use super::validator::ValidatedPatch;
use crate::errors::{PatchError, Result};
use serde_json::{Map, Value};

/// Build the patch that turns `post_state` back into `pre_state`.
///
/// `post_state` must be what [`apply`](super::apply) produced for the same
/// inputs. Any disagreement is an internal invariant violation.
pub fn build_inverse(
    pre_state: &Map<String, Value>,
    patch: &ValidatedPatch,
    post_state: &Map<String, Value>,
) -> Result<PatchDocument> {
    let mut doc = Value::Object(pre_state.clone());
    let mut steps: Vec<Vec<PatchOperation>> = Vec::with_capacity(patch.document().len());

    for (index, op) in patch.document().iter().enumerate() {
        let effect = apply_step(&mut doc, op).map_err(|e| {
            tracing::error!(
                op_index = index,
                error = %e,
                "forward patch failed to replay while building inverse"
            );
            PatchError::internal(format!(
                "inverse construction failed at operation {index}: {e}"
            ))
        })?;
        steps.push(invert_step(op, effect));
    }

    if doc.as_object() != Some(post_state) {
        tracing::error!("replayed patch diverged from the committed post-state");
        return Err(PatchError::internal(
            "inverse construction diverged from post-state",
        ));
    }

    Ok(PatchDocument::new(steps.into_iter().rev().flatten().collect()))
}

/// Inverse of one operation, in the order it must be applied
fn invert_step(op: &PatchOperation, effect: StepEffect) -> Vec<PatchOperation> {
    let StepEffect {
        path,
        replaced,
        removed,
    } = effect;

    match op {
        PatchOperation::Add { .. } | PatchOperation::Copy { .. } => vec![undo_add(path, replaced)],
        PatchOperation::Remove { .. } => match removed {
            Some(value) => vec![PatchOperation::Add { path, value }],
            None => Vec::new(),
        },
        PatchOperation::Replace { .. } => match replaced {
            Some(value) => vec![PatchOperation::Replace { path, value }],
            None => Vec::new(),
        },
        PatchOperation::Move { from, .. } => match (removed, replaced) {
            // Moving onto itself changed nothing.
            (None, _) => Vec::new(),
            (Some(_), None) => vec![PatchOperation::Move {
                from: path,
                path: from.clone(),
            }],
            // The destination held a value; put it back, then re-add the
            // moved value at its source.
            (Some(moved), Some(old)) => vec![
                PatchOperation::Replace { path, value: old },
                PatchOperation::Add {
                    path: from.clone(),
                    value: moved,
                },
            ],
        },
        PatchOperation::Test { .. } => Vec::new(),
    }
}

fn undo_add(path: super::pointer::Pointer, replaced: Option<Value>) -> PatchOperation {
    match replaced {
        Some(value) => PatchOperation::Replace { path, value },
        None => PatchOperation::Remove { path },
    }
}
