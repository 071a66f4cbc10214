//! Orchestrator state and progress reporting.

use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of an indexing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexState {
    #[default]
    Standby,
    Scanning,
    Indexing,
    Indexed,
    Error,
}

impl IndexState {
    /// Whether queries may be answered in this state.
    pub fn is_searchable(&self) -> bool {
        matches!(self, Self::Indexing | Self::Indexed)
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standby => "Standby",
            Self::Scanning => "Scanning",
            Self::Indexing => "Indexing",
            Self::Indexed => "Indexed",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Snapshot of orchestrator progress, published on every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStatus {
    pub state: IndexState,
    /// Human-readable description of the current step or failure
    pub message: String,
    /// Files handled so far in the current run
    pub processed: usize,
    /// Files the current run intends to handle
    pub total: usize,
    /// Workspace files by extension
    pub file_type_stats: BTreeMap<String, usize>,
}

/// Counters for one indexing run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Files found in the workspace
    pub files_scanned: usize,
    /// New or edited files
    pub files_changed: usize,
    /// Files gone from the workspace
    pub files_deleted: usize,
    /// Changed files whose segments reached the vector store
    pub files_processed: usize,
    /// Files skipped because they could not be read or parsed
    pub files_skipped: usize,
    pub segments_upserted: usize,
    /// Batches dropped because embedding failed
    pub batches_failed: usize,
    pub embedding_calls: usize,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_searchable_states() {
        assert!(IndexState::Indexed.is_searchable());
        assert!(IndexState::Indexing.is_searchable());
        assert!(!IndexState::Standby.is_searchable());
        assert!(!IndexState::Scanning.is_searchable());
        assert!(!IndexState::Error.is_searchable());
    }

    #[test]
    fn test_status_default() {
        let status = IndexStatus::default();
        assert_eq!(status.state, IndexState::Standby);
        assert_eq!(status.processed, 0);
        assert!(status.file_type_stats.is_empty());
        assert_eq!(IndexState::Indexing.to_string(), "Indexing");
    }
}
