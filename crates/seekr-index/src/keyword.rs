//! Line-oriented keyword search capability.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::RegexBuilder;
use tracing::debug;

use crate::workspace::to_relative;

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    /// Path relative to the searched workspace root
    pub file_path: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// The matching line, trimmed
    pub text: String,
}

/// `grep(pattern, directory)` over a workspace.
#[async_trait]
pub trait KeywordSearcher: Send + Sync {
    /// Search `directory` (absolute) for `pattern`. Paths in the result are
    /// relative to `workspace_root`.
    async fn grep(&self, pattern: &str, directory: &Path, workspace_root: &Path) -> Result<Vec<KeywordMatch>>;
}

/// [`KeywordSearcher`] that walks files honoring `.gitignore`.
#[derive(Debug, Clone)]
pub struct RegexKeywordSearcher {
    max_matches: usize,
    max_file_size: u64,
    case_insensitive: bool,
}

impl Default for RegexKeywordSearcher {
    fn default() -> Self {
        Self {
            max_matches: 200,
            max_file_size: 1024 * 1024,
            case_insensitive: true,
        }
    }
}

impl RegexKeywordSearcher {
    pub fn new(max_matches: usize) -> Self {
        Self {
            max_matches,
            ..Self::default()
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_insensitive = false;
        self
    }

    fn grep_blocking(&self, pattern: &str, directory: &Path, root: &Path) -> Result<Vec<KeywordMatch>> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(self.case_insensitive)
            .build()
            .map_err(|e| anyhow!("Invalid search pattern '{}': {}", pattern, e))?;

        let mut matches = Vec::new();
        let walker = WalkBuilder::new(directory)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .build();

        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > self.max_file_size).unwrap_or(true) {
                continue;
            }
            // Binary and non-UTF-8 files are not searchable.
            let Ok(contents) = std::fs::read_to_string(path) else {
                continue;
            };
            let Some(relative) = to_relative(root, path) else {
                continue;
            };

            for (idx, line) in contents.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(KeywordMatch {
                        file_path: relative.clone(),
                        line: idx + 1,
                        text: line.trim().to_string(),
                    });
                    if matches.len() >= self.max_matches {
                        debug!("Keyword search hit the {} match limit", self.max_matches);
                        return Ok(matches);
                    }
                }
            }
        }

        Ok(matches)
    }
}

#[async_trait]
impl KeywordSearcher for RegexKeywordSearcher {
    async fn grep(&self, pattern: &str, directory: &Path, workspace_root: &Path) -> Result<Vec<KeywordMatch>> {
        let searcher = self.clone();
        let pattern = pattern.to_string();
        let directory: PathBuf = directory.to_path_buf();
        let root: PathBuf = workspace_root.to_path_buf();
        tokio::task::spawn_blocking(move || searcher.grep_blocking(&pattern, &directory, &root))
            .await
            .map_err(|e| anyhow!("Keyword search task failed: {}", e))?
    }
}

/// Build a case-insensitive alternation of the query's words, so a natural
/// language query still finds lines mentioning its identifiers.
pub fn query_to_pattern(query: &str) -> Option<String> {
    let words: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.len() >= 3)
        .map(regex::escape)
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(format!(r"\b({})\b", words.join("|")))
    }
}
