//! Provider-agnostic vector-store adapter layer.
//!
//! A backend implements [`VectorStoreAdapter`]; collection setup goes through
//! a [`CollectionManager`] so concurrent initializers share one request, and
//! directory or file scoping goes through a [`filter::FilterTranslator`].

pub mod collection;
pub mod filter;
pub mod memory;
pub mod qdrant;

pub use collection::CollectionManager;
pub use filter::{FilterTranslator, PointFilter};

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::CodeSegment;

/// Errors raised at the vector-store boundary.
///
/// `Clone` so one collection-setup outcome can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorStoreError {
    #[error("Connection to vector store failed: {0}")]
    Connection(String),

    #[error("Collection not found: {0}")]
    NotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Collection '{collection}' has dimension {existing} but {requested} was requested: {reason}")]
    DimensionMismatch {
        collection: String,
        existing: u64,
        requested: u64,
        reason: String,
    },

    #[error("Vector store error: {0}")]
    Backend(String),
}

impl VectorStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Payload of a point holding one code segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentPayload {
    /// Workspace-relative file path
    pub file_path: String,
    /// Name of the declaration, when the segment has one
    pub identifier: Option<String>,
    /// Kind of segment ("function", "class", "lines", ...)
    pub kind: String,
    /// Start line (1-indexed)
    pub start_line: usize,
    /// End line (1-indexed, inclusive)
    pub end_line: usize,
    /// Segment text
    pub code_chunk: String,
    /// Hash of the segment text
    pub segment_hash: String,
    /// Directory components keyed by depth ("0" → first component)
    pub path_segments: BTreeMap<String, String>,
}

impl SegmentPayload {
    pub fn from_segment(segment: &CodeSegment) -> Self {
        Self {
            file_path: segment.file_path.clone(),
            identifier: segment.identifier.clone(),
            kind: segment.kind.clone(),
            start_line: segment.start_line,
            end_line: segment.end_line,
            code_chunk: segment.content.clone(),
            segment_hash: segment.segment_hash.clone(),
            path_segments: filter::path_segments(&segment.file_path),
        }
    }

    /// Reject payloads that would break filtering or result rendering.
    pub fn validate(&self) -> Result<(), VectorStoreError> {
        if self.file_path.is_empty() {
            return Err(VectorStoreError::InvalidPayload(
                "segment payload has an empty filePath".to_string(),
            ));
        }
        if self.start_line == 0 || self.end_line < self.start_line {
            return Err(VectorStoreError::InvalidPayload(format!(
                "segment payload for {} has line range {}-{}",
                self.file_path, self.start_line, self.end_line
            )));
        }
        if self.path_segments != filter::path_segments(&self.file_path) {
            return Err(VectorStoreError::InvalidPayload(format!(
                "pathSegments do not match filePath {}",
                self.file_path
            )));
        }
        Ok(())
    }
}

/// Payload of the point recording whether the last run completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub indexing_complete: bool,
    /// Unix seconds
    pub updated_at: u64,
}

impl IndexMetadata {
    pub fn now(indexing_complete: bool) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            indexing_complete,
            updated_at,
        }
    }
}

/// Tagged payload crossing the adapter boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointPayload {
    Segment(SegmentPayload),
    Metadata(IndexMetadata),
}

impl PointPayload {
    /// Value of the `type` tag for metadata points.
    pub const METADATA_TAG: &'static str = "metadata";

    pub fn validate(&self) -> Result<(), VectorStoreError> {
        match self {
            Self::Segment(segment) => segment.validate(),
            Self::Metadata(_) => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, VectorStoreError> {
        serde_json::to_value(self).map_err(|e| VectorStoreError::InvalidPayload(e.to_string()))
    }

    /// Parse and validate a payload read back from a backend.
    pub fn from_json(value: serde_json::Value) -> Result<Self, VectorStoreError> {
        let payload: Self = serde_json::from_value(value)
            .map_err(|e| VectorStoreError::InvalidPayload(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }
}

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    /// Deterministic UUID string
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl VectorPoint {
    /// Build the point for an embedded segment.
    pub fn for_segment(segment: &CodeSegment, vector: Vec<f32>) -> Self {
        Self {
            id: segment.point_id(),
            vector,
            payload: PointPayload::Segment(SegmentPayload::from_segment(segment)),
        }
    }
}

/// A similarity-search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    /// Similarity score (higher is better)
    pub score: f32,
    pub payload: SegmentPayload,
}

/// Optional operations a backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub delete_by_filter: bool,
    pub filter_scroll: bool,
}

/// Stable id of the indexing-metadata point.
pub fn metadata_point_id() -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, b"seekr:indexing-metadata").to_string()
}

/// Contract every vector database backend satisfies.
#[async_trait]
pub trait VectorStoreAdapter: Send + Sync {
    /// Collection this adapter writes to.
    fn collection_name(&self) -> &str;

    /// Vector size of the embedder this adapter was configured for.
    fn dimension(&self) -> usize;

    fn capabilities(&self) -> Capabilities;

    /// Make sure `name` exists with vectors of `dimension`. Returns true when
    /// the collection was created or recreated, meaning it is empty.
    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<bool, VectorStoreError>;

    /// Ensure this adapter's own collection.
    async fn initialize(&self) -> Result<bool, VectorStoreError> {
        let name = self.collection_name().to_string();
        self.ensure_collection(&name, self.dimension()).await
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError>;

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&PointFilter>,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError>;

    async fn delete_by_filter(&self, _filter: &PointFilter) -> Result<(), VectorStoreError> {
        Err(VectorStoreError::Unsupported("delete_by_filter"))
    }

    /// Delete every point of the given files. Deleting from a collection that
    /// does not exist yet succeeds without doing anything.
    async fn delete_points_by_multiple_file_paths(
        &self,
        paths: &[String],
    ) -> Result<(), VectorStoreError> {
        if paths.is_empty() || !self.collection_exists().await? {
            return Ok(());
        }
        self.delete_by_filter(&PointFilter::FilePaths(paths.to_vec()))
            .await
    }

    /// Remove every point but keep the collection.
    async fn clear_all(&self) -> Result<(), VectorStoreError>;

    async fn delete_collection(&self) -> Result<(), VectorStoreError>;

    async fn collection_exists(&self) -> Result<bool, VectorStoreError>;

    async fn mark_indexing_complete(&self) -> Result<(), VectorStoreError>;

    async fn mark_indexing_incomplete(&self) -> Result<(), VectorStoreError>;

    /// Whether the collection holds a completed index.
    async fn has_indexed_data(&self) -> Result<bool, VectorStoreError>;
}
