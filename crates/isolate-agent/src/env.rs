//! Environment assembly for child processes.

use std::collections::BTreeMap;

/// Merge a base environment with request overrides; overrides win.
///
/// The server passes no base today (children see exactly the request env),
/// but the merge contract is part of the exec semantics.
pub fn merge_env(
    base: Option<&BTreeMap<String, String>>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.cloned().unwrap_or_default();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}
