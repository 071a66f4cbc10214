//! Which files to process first.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use crate::workspace::parent_dir;

/// Processing urgency, lowest first so `Ord` sorts by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilePriority {
    /// Everything else
    Low,
    /// Shares a directory with an open file
    Medium,
    /// Indexed within the recency window
    High,
    /// Open in the host
    Critical,
}

/// Scheduling record for a file known to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFileRecord {
    pub path: String,
    pub content_hash: String,
    pub last_indexed_at: SystemTime,
    pub priority: FilePriority,
}

/// Priority of `path` given the open files and when it was last indexed.
pub fn priority_for(
    path: &str,
    open_files: &HashSet<String>,
    last_indexed_at: Option<SystemTime>,
    now: SystemTime,
    recency_window: Duration,
) -> FilePriority {
    if open_files.contains(path) {
        return FilePriority::Critical;
    }
    let recent = last_indexed_at
        .and_then(|t| now.duration_since(t).ok())
        .map_or(false, |age| age <= recency_window);
    if recent {
        return FilePriority::High;
    }
    let dir = parent_dir(path);
    if open_files.iter().any(|open| parent_dir(open) == dir) {
        return FilePriority::Medium;
    }
    FilePriority::Low
}

/// Sort most urgent first; ties keep path order so runs are reproducible.
pub fn sort_by_priority(paths: &mut [(String, FilePriority)]) {
    paths.sort_by(|(pa, a), (pb, b)| b.cmp(a).then_with(|| pa.cmp(pb)));
}
