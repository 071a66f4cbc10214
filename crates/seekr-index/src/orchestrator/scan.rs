//! Change detection between the fingerprint cache and the live tree.

use std::collections::HashMap;

/// Result of comparing stored fingerprints with the current tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanDiff {
    /// New paths and paths whose hash differs, sorted
    pub changed: Vec<String>,
    /// Fingerprinted paths missing from the tree, sorted
    pub deleted: Vec<String>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Single pass over both maps of path → hash.
pub fn diff_against_fingerprints(
    stored: &HashMap<String, String>,
    current: &HashMap<String, String>,
) -> ScanDiff {
    let mut changed: Vec<String> = current
        .iter()
        .filter(|(path, hash)| stored.get(*path) != Some(*hash))
        .map(|(path, _)| path.clone())
        .collect();
    let mut deleted: Vec<String> = stored
        .keys()
        .filter(|path| !current.contains_key(*path))
        .cloned()
        .collect();
    changed.sort();
    deleted.sort();
    ScanDiff { changed, deleted }
}
