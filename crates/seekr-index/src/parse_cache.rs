//! Bounded cache of parsed-but-not-yet-embedded files.
//!
//! Keyed by path; an entry is only served while the file's hash still
//! matches. Capacity overflow evicts the least recently used entry.

use std::collections::{HashMap, VecDeque};

use crate::parser::CodeSegment;

/// Segments parsed from one version of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCacheEntry {
    pub path: String,
    pub content_hash: String,
    pub segments: Vec<CodeSegment>,
}

/// LRU map of [`ParseCacheEntry`] by path.
#[derive(Debug)]
pub struct ParseCache {
    capacity: usize,
    entries: HashMap<String, ParseCacheEntry>,
    order: VecDeque<String>,
}

impl ParseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Cached segments for `path`, only if parsed from `content_hash`.
    /// A stale entry is dropped.
    pub fn get(&mut self, path: &str, content_hash: &str) -> Option<ParseCacheEntry> {
        match self.entries.get(path) {
            Some(entry) if entry.content_hash == content_hash => {
                let entry = entry.clone();
                self.touch(path);
                Some(entry)
            }
            Some(_) => {
                self.remove(path);
                None
            }
            None => None,
        }
    }

    /// Insert or replace, evicting the oldest entries past capacity.
    pub fn insert(&mut self, entry: ParseCacheEntry) {
        let path = entry.path.clone();
        if self.entries.insert(path.clone(), entry).is_some() {
            self.touch(&path);
        } else {
            self.order.push_back(path);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn remove(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            self.order.retain(|p| p != path);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn touch(&mut self, path: &str) {
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            if let Some(p) = self.order.remove(pos) {
                self.order.push_back(p);
            }
        }
    }
}

impl Default for ParseCache {
    fn default() -> Self {
        Self::new(crate::DEFAULT_PARSE_CACHE_CAPACITY)
    }
}
