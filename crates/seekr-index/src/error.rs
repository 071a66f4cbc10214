//! Error taxonomy shared by the orchestrator and the search service.

use thiserror::Error;

use crate::fingerprint::FingerprintError;
use crate::vector_store::VectorStoreError;

/// Errors surfaced across the public indexing and search API.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The feature is disabled or misconfigured. Fatal to the requested
    /// operation, never to the process.
    #[error("Code indexing is not configured: {0}")]
    Configuration(String),

    /// The vector store could not be reached or the collection could not be
    /// created.
    #[error("Failed to initialize collection '{collection}': {source}")]
    CollectionInit {
        collection: String,
        #[source]
        source: VectorStoreError,
    },

    /// The existing collection has a different vector size than the embedder.
    #[error("Collection '{collection}' has dimension {existing}, embedder produces {requested}: {reason}")]
    DimensionMismatch {
        collection: String,
        existing: u64,
        requested: u64,
        reason: String,
    },

    /// A single file could not be parsed. Recovered by skipping the file.
    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// The index is not ready to answer queries.
    #[error("Search is unavailable while the index is {state}")]
    SearchUnavailable { state: String },

    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Fingerprint storage error: {0}")]
    Storage(#[from] FingerprintError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The run was interrupted by `stop_indexing` or a branch change.
    #[error("Indexing was cancelled")]
    Cancelled,
}

impl IndexError {
    /// Map a collection-setup failure, keeping the backend's message.
    pub fn from_init(collection: &str, err: VectorStoreError) -> Self {
        match err {
            VectorStoreError::DimensionMismatch {
                collection,
                existing,
                requested,
                reason,
            } => Self::DimensionMismatch {
                collection,
                existing,
                requested,
                reason,
            },
            other => Self::CollectionInit {
                collection: collection.to_string(),
                source: other,
            },
        }
    }

    /// Whether this error belongs to a single file rather than the whole run.
    pub fn is_file_level(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Io { .. })
    }
}
