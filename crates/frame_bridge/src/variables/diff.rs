//! Key-level diff between two snapshots of a variable mapping.

use super::Variables;
use crate::utils::json_equal;

/// Keys classified by how they changed. Each list is in the order the keys
/// appear in their source mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableDiff {
    /// In `current` only
    pub added: Vec<String>,
    /// In `previous` only
    pub removed: Vec<String>,
    /// In both, with values that are not deeply equal
    pub updated: Vec<String>,
}

impl VariableDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Total number of changed keys.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.updated.len()
    }
}

/// Classifies every key of `previous` and `current`.
///
/// Values are compared structurally (see [`json_equal`]), so a rebuilt but
/// identical nested value is not reported as updated.
pub fn diff(previous: &Variables, current: &Variables) -> VariableDiff {
    let mut result = VariableDiff::default();

    for (key, value) in current {
        match previous.get(key) {
            None => result.added.push(key.clone()),
            Some(old) if !json_equal(old, value) => result.updated.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in previous.keys() {
        if !current.contains_key(key) {
            result.removed.push(key.clone());
        }
    }

    result
}
