//! Reversible change sets for cached JSON documents.
//!
//! An optimistic update is recorded as the list of leaf-level changes between
//! the data before and after the update recipe ran. Reverting walks the list
//! backwards and restores a location only while it still holds the value this
//! change set wrote, so reverting one mutation never clobbers what an
//! interleaved mutation wrote elsewhere in the same document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A single location rewrite. `None` means the location is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: Vec<PathSegment>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(Vec<Change>);

/// Outcome of reverting a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revert {
    pub reverted: usize,
    /// Locations that were modified again after this change set and were left alone.
    pub conflicts: usize,
}

impl ChangeSet {
    /// Compute the changes that turn `before` into `after`.
    ///
    /// Objects are compared key by key and equal-length arrays index by index;
    /// anything else is recorded as a whole-value replacement.
    pub fn diff(before: &Value, after: &Value) -> Self {
        let mut changes = Vec::new();
        let mut path = Vec::new();
        diff_into(&mut path, Some(before), Some(after), &mut changes);
        Self(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn changes(&self) -> &[Change] {
        &self.0
    }

    /// Write every change's `after` value into `target`.
    ///
    /// Returns the number of locations that could not be reached.
    pub fn apply(&self, target: &mut Value) -> usize {
        self.0
            .iter()
            .filter(|change| !set_at(target, &change.path, change.after.clone()))
            .count()
    }

    /// Restore every location that still holds this change set's value.
    pub fn revert(&self, target: &mut Value) -> Revert {
        let mut outcome = Revert::default();
        for change in self.0.iter().rev() {
            if get_at(target, &change.path) == change.after.as_ref()
                && set_at(target, &change.path, change.before.clone())
            {
                outcome.reverted += 1;
            } else {
                outcome.conflicts += 1;
            }
        }
        outcome
    }
}

fn diff_into(
    path: &mut Vec<PathSegment>,
    before: Option<&Value>,
    after: Option<&Value>,
    out: &mut Vec<Change>,
) {
    if before == after {
        return;
    }

    match (before, after) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let mut names: Vec<&String> = old.keys().chain(new.keys()).collect();
            names.sort_unstable();
            names.dedup();
            for name in names {
                path.push(PathSegment::Key(name.clone()));
                diff_into(path, old.get(name), new.get(name), out);
                path.pop();
            }
        }
        (Some(Value::Array(old)), Some(Value::Array(new))) if old.len() == new.len() => {
            for (index, (old_item, new_item)) in old.iter().zip(new).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(path, Some(old_item), Some(new_item), out);
                path.pop();
            }
        }
        _ => out.push(Change {
            path: path.clone(),
            before: before.cloned(),
            after: after.cloned(),
        }),
    }
}

fn get_at<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| match (segment, node) {
        (PathSegment::Key(name), Value::Object(map)) => map.get(name),
        (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
        _ => None,
    })
}

fn get_at_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |node, segment| match (segment, node) {
        (PathSegment::Key(name), Value::Object(map)) => map.get_mut(name),
        (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
        _ => None,
    })
}

/// Write `value` at `path`, removing the location for `None`.
fn set_at(root: &mut Value, path: &[PathSegment], value: Option<Value>) -> bool {
    let Some((last, parent_path)) = path.split_last() else {
        *root = value.unwrap_or(Value::Null);
        return true;
    };
    let Some(parent) = get_at_mut(root, parent_path) else {
        return false;
    };

    match (last, parent, value) {
        (PathSegment::Key(name), Value::Object(map), Some(value)) => {
            map.insert(name.clone(), value);
            true
        }
        (PathSegment::Key(name), Value::Object(map), None) => {
            map.remove(name);
            true
        }
        (PathSegment::Index(index), Value::Array(items), Some(value)) if *index < items.len() => {
            items[*index] = value;
            true
        }
        _ => false,
    }
}
