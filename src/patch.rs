use json_patch::{Patch, PatchOperation};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to serialize original object: {0}")]
    SerializeOriginal(#[source] serde_json::Error),
    #[error("failed to serialize mutated object: {0}")]
    SerializeMutated(#[source] serde_json::Error),
}

/// Paths that are never patched, with the reason. Operations on a listed path
/// or anything below it are dropped.
pub const IGNORED_PATCH_PATHS: [(&str, &str); 5] = [
    ("/status", "populated by the API server"),
    ("/metadata/creationTimestamp", "populated by the API server"),
    (
        "/spec/template/metadata/creationTimestamp",
        "populated by the API server",
    ),
    ("/apiVersion", "typed decoding normalizes legacy group versions"),
    ("/kind", "typed decoding normalizes legacy group versions"),
];

pub fn is_ignored_path(path: &str) -> bool {
    IGNORED_PATCH_PATHS.iter().any(|(ignored, _)| {
        path.strip_prefix(ignored)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

/// Computes the RFC 6902 patch turning `original` into `mutated`.
///
/// Both sides go through the same encoder, so fields the encoder drops are
/// missing from both and never show up as removals.
/// Returns `Ok(None)` when nothing but ignored paths changed.
pub fn compute_patch<T: Serialize>(
    original: &T,
    mutated: &T,
) -> Result<Option<Patch>, PatchError> {
    let original = serde_json::to_value(original).map_err(PatchError::SerializeOriginal)?;
    let mutated = serde_json::to_value(mutated).map_err(PatchError::SerializeMutated)?;

    let operations: Vec<PatchOperation> = json_patch::diff(&original, &mutated)
        .0
        .into_iter()
        .filter(|op| !is_ignored_path(op.path().as_str()))
        .collect();

    if operations.is_empty() {
        return Ok(None);
    }
    Ok(Some(Patch(operations)))
}
