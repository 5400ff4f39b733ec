//! Four-way merge of JSON configuration files
//!
//! Documents are flattened into key paths. Objects recurse, while arrays and
//! scalars (and empty objects) are leaves compared as a whole. The source
//! side's changes between its previous and current revisions are replayed
//! onto the target's current document:
//!
//! - a key only the source changed takes the source's value (or is removed),
//! - a key both sides changed keeps the target's value, unless both values are
//!   version strings, in which case the greater version wins.
//!
//! Output is pretty printed with two spaces and keeps the key order of the
//! target document; new keys are appended to their parent object.

use std::path::Path;

use log::debug;
use serde_json::{Map, Value as JsonValue};

use super::{compare_versions, FileRevisions};
use crate::error::{Error, Result};
use crate::filesystem::FileSystem;

type KeyPath = Vec<String>;

/// Flattens a document into `(path, leaf)` pairs in document order.
pub fn flatten_json(value: &JsonValue) -> Vec<(KeyPath, JsonValue)> {
    let mut leaves = Vec::new();
    flatten_into(value, &mut Vec::new(), &mut leaves);
    leaves
}

fn flatten_into(value: &JsonValue, prefix: &mut KeyPath, leaves: &mut Vec<(KeyPath, JsonValue)>) {
    match value {
        JsonValue::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                prefix.push(key.clone());
                flatten_into(child, prefix, leaves);
                prefix.pop();
            }
        }
        // An empty document has no keys to merge
        JsonValue::Object(_) if prefix.is_empty() => {}
        _ => leaves.push((prefix.clone(), value.clone())),
    }
}

fn lookup<'a>(leaves: &'a [(KeyPath, JsonValue)], path: &[String]) -> Option<&'a JsonValue> {
    leaves
        .iter()
        .find(|(p, _)| p.as_slice() == path)
        .map(|(_, v)| v)
}

/// Sets a value at a key path, creating (or replacing non-object)
/// intermediate values with objects.
fn set_at_path(root: &mut JsonValue, path: &[String], value: JsonValue) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for key in parents {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(map) = current else {
            return;
        };
        current = map
            .entry(key.clone())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }

    if !current.is_object() {
        *current = JsonValue::Object(Map::new());
    }
    if let JsonValue::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

fn remove_at_path(root: &mut JsonValue, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = root;
    for key in parents {
        match current.get_mut(key.as_str()) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let JsonValue::Object(map) = current {
        map.shift_remove(last.as_str());
    }
}

fn parse_document(content: Option<&str>, what: &str) -> Result<JsonValue> {
    match content {
        None => Ok(JsonValue::Object(Map::new())),
        Some(text) if text.trim().is_empty() => Ok(JsonValue::Object(Map::new())),
        Some(text) => serde_json::from_str(text).map_err(|err| Error::Merge {
            operation: "json merge".to_string(),
            message: format!("Failed to parse {}: {}", what, err),
        }),
    }
}

/// Picks the value for a key both sides changed.
fn resolve_both_changed(target: Option<&JsonValue>, source: Option<&JsonValue>) -> Option<JsonValue> {
    match (target, source) {
        (Some(JsonValue::String(t)), Some(JsonValue::String(s))) => match compare_versions(t, s) {
            Some(std::cmp::Ordering::Less) => Some(JsonValue::String(s.clone())),
            _ => None,
        },
        _ => None,
    }
}

/// Merges document contents. `None` stands for a missing file.
///
/// Returns the merged document, pretty printed.
pub fn merge_json_contents(
    target_previous: Option<&str>,
    target_current: Option<&str>,
    source_previous: Option<&str>,
    source_current: Option<&str>,
) -> Result<String> {
    let target_previous = flatten_json(&parse_document(target_previous, "previous target")?);
    let mut target_value = parse_document(target_current, "current target")?;
    let target_current = flatten_json(&target_value);
    let source_previous = flatten_json(&parse_document(source_previous, "previous source")?);
    let source_current = flatten_json(&parse_document(source_current, "current source")?);

    // Union of source keys, previous order first
    let mut keys: Vec<&KeyPath> = source_previous.iter().map(|(p, _)| p).collect();
    for (path, _) in &source_current {
        if !keys.contains(&path) {
            keys.push(path);
        }
    }

    for path in keys {
        let source_before = lookup(&source_previous, path);
        let source_after = lookup(&source_current, path);
        if source_before == source_after {
            continue;
        }

        let target_before = lookup(&target_previous, path);
        let target_after = lookup(&target_current, path);

        let new_value = if target_before == target_after {
            source_after.cloned()
        } else {
            match resolve_both_changed(target_after, source_after) {
                Some(value) => Some(value),
                None => {
                    debug!("Keeping target value of {}", path.join(":"));
                    continue;
                }
            }
        };

        match new_value {
            Some(value) => set_at_path(&mut target_value, path, value),
            None => remove_at_path(&mut target_value, path),
        }
    }

    let mut serialized = serde_json::to_string_pretty(&target_value).map_err(|err| Error::Merge {
        operation: "json merge".to_string(),
        message: format!("Failed to serialize JSON: {}", err),
    })?;
    serialized.push('\n');
    Ok(serialized)
}

/// Merges a JSON file of the target repository with the changes made to the
/// same file in the source repository.
pub struct JsonFileMerger<'a> {
    fs: &'a dyn FileSystem,
}

impl<'a> JsonFileMerger<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self { fs }
    }

    /// Writes the merged file into the target's working tree and stages it.
    ///
    /// With `allow_missing_files`, a file absent from any revision is treated
    /// as an empty document; otherwise a missing file is an error. Returns
    /// whether the working tree content changed.
    pub fn merge_jsons(
        &self,
        target: FileRevisions<'_>,
        source: FileRevisions<'_>,
        allow_missing_files: bool,
    ) -> Result<bool> {
        let read = |content: Option<String>, revisions: &FileRevisions<'_>, r#ref: &str| {
            if content.is_none() && !allow_missing_files {
                return Err(Error::Merge {
                    operation: "json merge".to_string(),
                    message: format!("File {} not found at {}", revisions.path, r#ref),
                });
            }
            Ok(content)
        };

        let target_previous = read(target.read_previous()?, &target, target.previous_ref)?;
        let target_current = read(target.read_current()?, &target, target.current_ref)?;
        let source_previous = read(source.read_previous()?, &source, source.previous_ref)?;
        let source_current = read(source.read_current()?, &source, source.current_ref)?;

        if target_current.is_none() && source_current.is_none() {
            return Ok(false);
        }

        let merged = merge_json_contents(
            target_previous.as_deref(),
            target_current.as_deref(),
            source_previous.as_deref(),
            source_current.as_deref(),
        )?;

        let full_path = target.repo.path().join(Path::new(target.path));
        let existing = self.fs.read_to_string(&full_path)?;
        if existing.as_deref() == Some(merged.as_str()) {
            return Ok(false);
        }

        self.fs.write(&full_path, &merged)?;
        target.repo.stage(&[target.path])?;
        Ok(true)
    }
}
