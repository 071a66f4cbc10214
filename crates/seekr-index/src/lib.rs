//! Incremental semantic indexing and hybrid search for a live workspace.
//!
//! This crate provides:
//! - A durable content-fingerprint cache for change detection
//! - An index orchestrator with priority scheduling and a parse-result cache
//! - A provider-agnostic vector-store adapter layer (Qdrant and in-memory)
//! - Hybrid search (vector + keyword) with result and embedding caches
//! - Branch and file watching that keeps the index in step with the tree

pub mod branch;
pub mod embeddings;
pub mod error;
pub mod fingerprint;
pub mod keyword;
pub mod orchestrator;
pub mod parse_cache;
pub mod parser;
pub mod search;
pub mod vector_store;
pub mod watcher;
pub mod workspace;

// Re-exports
pub use branch::{BranchChangeListener, BranchWatcher, BranchWatcherConfig};
pub use embeddings::{Embedder, HttpEmbedder};
pub use error::IndexError;
pub use fingerprint::{
    ContentFingerprintCache, FingerprintEntry, FingerprintStore, JsonFileStore, MemoryFingerprintStore,
};
pub use keyword::{KeywordMatch, KeywordSearcher, RegexKeywordSearcher};
pub use orchestrator::{
    FilePriority, IndexOrchestrator, IndexState, IndexStats, IndexStatus, IndexedFileRecord,
    OrchestratorConfig,
};
pub use parse_cache::{ParseCache, ParseCacheEntry};
pub use parser::{CodeParser, CodeSegment, TreeSitterParser};
pub use search::{
    CacheStats, HybridConfig, HybridConfigUpdate, SearchCacheConfig, SearchResult, SearchService,
};
pub use vector_store::{
    memory::InMemoryVectorStore, qdrant::{QdrantAdapter, QdrantConfig}, Capabilities, CollectionManager,
    PointFilter, PointPayload, ScoredPoint, SegmentPayload, VectorPoint, VectorStoreAdapter,
    VectorStoreError,
};
pub use watcher::{FileEvent, FileWatcher, WatcherConfig};
pub use workspace::{FileSystem, WorkspaceFs};

/// Default capacity of the parse-result cache.
pub const DEFAULT_PARSE_CACHE_CAPACITY: usize = 500;

/// Number of path-depth levels carried as payload indexes.
pub const PATH_SEGMENT_INDEX_DEPTH: usize = 5;
