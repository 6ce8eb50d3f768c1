//! JSON Patch (RFC 6902) operations over contract documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("test failed at {0}")]
    TestFailed(String),
}

/// One patch operation, tagged by `op` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }
}

/// Split a JSON pointer into unescaped reference tokens.
pub fn pointer_tokens(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Build a JSON pointer from path segments.
pub fn to_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| format!("/{}", s.as_ref().replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn parent_mut<'a>(
    document: &'a mut Value,
    pointer: &str,
) -> Result<(&'a mut Value, String), PatchError> {
    let mut tokens = pointer_tokens(pointer)?;
    let last = tokens
        .pop()
        .ok_or_else(|| PatchError::InvalidPointer(pointer.to_string()))?;
    let parent_pointer = to_pointer(&tokens);
    let parent = document
        .pointer_mut(&parent_pointer)
        .ok_or_else(|| PatchError::PathNotFound(pointer.to_string()))?;
    Ok((parent, last))
}

fn add(document: &mut Value, pointer: &str, value: Value) -> Result<(), PatchError> {
    if pointer.is_empty() {
        *document = value;
        return Ok(());
    }
    let (parent, key) = parent_mut(document, pointer)?;
    match parent {
        Value::Object(object) => {
            object.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
                return Ok(());
            }
            let index: usize = key
                .parse()
                .map_err(|_| PatchError::InvalidPointer(pointer.to_string()))?;
            if index > items.len() {
                return Err(PatchError::PathNotFound(pointer.to_string()));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::PathNotFound(pointer.to_string())),
    }
}

fn remove(document: &mut Value, pointer: &str) -> Result<Value, PatchError> {
    let (parent, key) = parent_mut(document, pointer)?;
    match parent {
        Value::Object(object) => object
            .remove(&key)
            .ok_or_else(|| PatchError::PathNotFound(pointer.to_string())),
        Value::Array(items) => {
            let index: usize = key
                .parse()
                .map_err(|_| PatchError::InvalidPointer(pointer.to_string()))?;
            if index >= items.len() {
                return Err(PatchError::PathNotFound(pointer.to_string()));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::PathNotFound(pointer.to_string())),
    }
}

fn get(document: &Value, pointer: &str) -> Result<Value, PatchError> {
    document
        .pointer(pointer)
        .cloned()
        .ok_or_else(|| PatchError::PathNotFound(pointer.to_string()))
}

/// Apply operations in order. The document is left untouched on failure.
pub fn apply(document: &Value, operations: &[PatchOperation]) -> Result<Value, PatchError> {
    let mut patched = document.clone();
    for operation in operations {
        match operation {
            PatchOperation::Add { path, value } => add(&mut patched, path, value.clone())?,
            PatchOperation::Remove { path } => {
                remove(&mut patched, path)?;
            }
            PatchOperation::Replace { path, value } => {
                if path.is_empty() {
                    patched = value.clone();
                } else {
                    remove(&mut patched, path)?;
                    add(&mut patched, path, value.clone())?;
                }
            }
            PatchOperation::Move { from, path } => {
                let value = remove(&mut patched, from)?;
                add(&mut patched, path, value)?;
            }
            PatchOperation::Copy { from, path } => {
                let value = get(&patched, from)?;
                add(&mut patched, path, value)?;
            }
            PatchOperation::Test { path, value } => {
                if !crate::schema::json_eq(&get(&patched, path)?, value) {
                    return Err(PatchError::TestFailed(path.clone()));
                }
            }
        }
    }
    Ok(patched)
}
