//! Directory and file scoping for vector-store operations.
//!
//! Every segment payload carries `pathSegments`, the file path's components
//! keyed by depth. A directory prefix becomes one equality condition per
//! depth, which gives component-exact prefix semantics: `src/utils` matches
//! `src/utils/foo.ts` but not `src/utilities/bar.ts`.

use std::collections::BTreeMap;

use crate::workspace::normalize_relative;

use super::SegmentPayload;

/// Backend-neutral scope for search and delete operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointFilter {
    /// Points whose file lies under a directory prefix.
    DirectoryPrefix(String),
    /// Points belonging to any of these files.
    FilePaths(Vec<String>),
}

impl PointFilter {
    /// Build a directory filter, or `None` when the prefix names the
    /// workspace root (`""`, `"."`, `"./"`).
    pub fn directory(prefix: &str) -> Option<Self> {
        normalize_directory_prefix(prefix).map(Self::DirectoryPrefix)
    }

    /// Whether a payload falls inside this scope.
    pub fn matches(&self, payload: &SegmentPayload) -> bool {
        match self {
            Self::DirectoryPrefix(prefix) => prefix_conditions(prefix)
                .iter()
                .all(|(depth, component)| {
                    payload.path_segments.get(&depth.to_string()) == Some(component)
                }),
            Self::FilePaths(paths) => paths.iter().any(|p| *p == payload.file_path),
        }
    }
}

/// Translates neutral filters into a backend's native filter language.
pub trait FilterTranslator {
    type Native;

    /// Filter matching every point under `prefix` (already normalized).
    fn directory_prefix(&self, prefix: &str) -> Self::Native;

    /// Filter matching every point of any of `paths`.
    fn file_paths(&self, paths: &[String]) -> Self::Native;

    fn translate(&self, filter: &PointFilter) -> Option<Self::Native> {
        match filter {
            PointFilter::DirectoryPrefix(prefix) => normalize_directory_prefix(prefix)
                .map(|prefix| self.directory_prefix(&prefix)),
            PointFilter::FilePaths(paths) if paths.is_empty() => None,
            PointFilter::FilePaths(paths) => Some(self.file_paths(paths)),
        }
    }
}

/// Normalize a directory prefix; `None` means "the whole workspace".
pub fn normalize_directory_prefix(prefix: &str) -> Option<String> {
    let normalized = normalize_relative(prefix);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Path components keyed by depth.
pub fn path_segments(path: &str) -> BTreeMap<String, String> {
    normalize_relative(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(depth, component)| (depth.to_string(), component.to_string()))
        .collect()
}

/// `(depth, component)` equality conditions for a normalized prefix.
pub fn prefix_conditions(prefix: &str) -> Vec<(usize, String)> {
    normalize_relative(prefix)
        .split('/')
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(depth, component)| (depth, component.to_string()))
        .collect()
}
