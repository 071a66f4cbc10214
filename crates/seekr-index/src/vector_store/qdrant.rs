//! Qdrant-backed vector store.
//!
//! One collection per workspace, named from a hash of the workspace path.
//! Cosine vectors with int8 scalar quantization, keyword payload indexes on
//! `type`, `filePath` and the first path-segment levels.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, vectors_config, Condition, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    GetPointsBuilder, ListValue, PointId, PointStruct, QuantizationType,
    ScalarQuantizationBuilder, SearchPointsBuilder, Struct, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::{Qdrant, QdrantError};
use tracing::{debug, info, warn};
use url::Url;

use super::filter::FilterTranslator;
use super::{
    metadata_point_id, Capabilities, CollectionManager, IndexMetadata, PointFilter, PointPayload,
    ScoredPoint, VectorPoint, VectorStoreAdapter, VectorStoreError,
};
use crate::workspace::workspace_hash;
use crate::PATH_SEGMENT_INDEX_DEPTH;

/// Used when no URL is configured (gRPC port).
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";

/// Connection settings for [`QdrantAdapter`].
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    /// Server URL; a bare hostname means plain HTTP on port 80
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Resolve a configured URL into `scheme://host:port[/path]`.
///
/// Explicit schemes, ports and paths are kept. A bare hostname is treated as
/// unencrypted HTTP on port 80. `None` or an empty string yields
/// [`DEFAULT_QDRANT_URL`].
pub fn resolve_url(raw: Option<&str>) -> Result<String, VectorStoreError> {
    let raw = match raw.map(str::trim) {
        Some(r) if !r.is_empty() => r,
        _ => return Ok(DEFAULT_QDRANT_URL.to_string()),
    };

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&candidate)
        .map_err(|e| VectorStoreError::Connection(format!("Invalid Qdrant URL '{raw}': {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| VectorStoreError::Connection(format!("Qdrant URL '{raw}' has no host")))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let path = url.path().trim_end_matches('/');

    Ok(format!("{}://{}:{}{}", url.scheme(), host, port, path))
}

/// Collection name for a workspace, optionally suffixed for an isolated
/// sub-index.
pub fn collection_name_for(workspace_root: &Path, suffix: Option<&str>) -> String {
    let hash = workspace_hash(workspace_root);
    let base = format!("ws-{}", &hash[..16]);
    match suffix.map(sanitize_suffix) {
        Some(s) if !s.is_empty() => format!("{base}-{s}"),
        _ => base,
    }
}

fn sanitize_suffix(suffix: &str) -> String {
    let mapped: String = suffix
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    trimmed.chars().take(32).collect()
}

/// Native Qdrant filter construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct QdrantFilterTranslator;

impl FilterTranslator for QdrantFilterTranslator {
    type Native = Filter;

    fn directory_prefix(&self, prefix: &str) -> Filter {
        let conditions: Vec<Condition> = super::filter::prefix_conditions(prefix)
            .into_iter()
            .map(|(depth, component)| Condition::matches(format!("pathSegments.{depth}"), component))
            .collect();
        Filter::must(conditions)
    }

    fn file_paths(&self, paths: &[String]) -> Filter {
        Filter::must([Condition::matches("filePath", paths.to_vec())])
    }
}

struct QdrantInner {
    client: Qdrant,
    collection_name: String,
    dimension: usize,
}

impl QdrantInner {
    async fn exists(&self, name: &str) -> Result<bool, VectorStoreError> {
        let collections = self.client.list_collections().await.map_err(classify)?;
        Ok(collections.collections.iter().any(|c| c.name == name))
    }

    async fn vector_size(&self, name: &str) -> Result<Option<u64>, VectorStoreError> {
        let info = self.client.collection_info(name).await.map_err(classify)?;
        let size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|config| match config {
                vectors_config::Config::Params(params) => Some(params.size),
                vectors_config::Config::ParamsMap(map) => map.map.values().next().map(|p| p.size),
            });
        Ok(size)
    }

    async fn create(&self, name: &str, dimension: usize) -> Result<(), VectorStoreError> {
        info!("Creating collection: {} with {} dimensions", name, dimension);
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine))
                    .quantization_config(
                        ScalarQuantizationBuilder::default()
                            .r#type(QuantizationType::Int8.into())
                            .quantile(0.99)
                            .always_ram(true),
                    ),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_payload_indexes(&self, name: &str) {
        let mut fields = vec!["type".to_string(), "filePath".to_string()];
        fields.extend((0..PATH_SEGMENT_INDEX_DEPTH).map(|depth| format!("pathSegments.{depth}")));

        for field in fields {
            let result = self
                .client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    name,
                    field.as_str(),
                    FieldType::Keyword,
                ))
                .await;
            if let Err(e) = result {
                let message = e.to_string();
                if !message.to_lowercase().contains("already exists") {
                    warn!("Failed to create payload index {} on {}: {}", field, name, message);
                }
            }
        }
    }

    /// Create the collection, or validate the existing one. Returns true when
    /// the collection is new or was recreated.
    async fn create_or_validate(&self, name: &str, dimension: usize) -> Result<bool, VectorStoreError> {
        if !self.exists(name).await? {
            self.create(name, dimension).await?;
            self.create_payload_indexes(name).await;
            info!("Collection {} created successfully", name);
            return Ok(true);
        }

        match self.vector_size(name).await? {
            Some(existing) if existing != dimension as u64 => {
                warn!(
                    "Collection {} has dimension {} but embedder produces {}; recreating it, existing vectors are lost",
                    name, existing, dimension
                );
                let mismatch = |reason: String| VectorStoreError::DimensionMismatch {
                    collection: name.to_string(),
                    existing,
                    requested: dimension as u64,
                    reason,
                };
                self.client
                    .delete_collection(name)
                    .await
                    .map_err(|e| mismatch(format!("delete failed: {e}")))?;
                self.create(name, dimension)
                    .await
                    .map_err(|e| mismatch(format!("recreate failed: {e}")))?;
                self.create_payload_indexes(name).await;
                Ok(true)
            }
            _ => {
                debug!("Collection {} already exists", name);
                self.create_payload_indexes(name).await;
                Ok(false)
            }
        }
    }
}

/// [`VectorStoreAdapter`] over a Qdrant server.
pub struct QdrantAdapter {
    inner: Arc<QdrantInner>,
    collections: CollectionManager,
    translator: QdrantFilterTranslator,
}

impl QdrantAdapter {
    /// Connect for `workspace_root`. The collection is not touched until
    /// [`VectorStoreAdapter::initialize`].
    pub fn connect(
        config: &QdrantConfig,
        workspace_root: &Path,
        collection_suffix: Option<&str>,
        dimension: usize,
    ) -> Result<Self, VectorStoreError> {
        let url = resolve_url(config.url.as_deref())?;
        info!("Connecting to Qdrant at {}", url);

        let mut builder = Qdrant::from_url(&url)
            .timeout(config.timeout)
            .skip_compatibility_check();
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(QdrantInner {
                client,
                collection_name: collection_name_for(workspace_root, collection_suffix),
                dimension,
            }),
            collections: CollectionManager::new(),
            translator: QdrantFilterTranslator,
        })
    }

    async fn upsert_once(&self, points: &[PointStruct]) -> Result<(), VectorStoreError> {
        self.inner
            .client
            .upsert_points(
                UpsertPointsBuilder::new(&self.inner.collection_name, points.to_vec()).wait(true),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn write_metadata(&self, complete: bool) -> Result<(), VectorStoreError> {
        let point = VectorPoint {
            id: metadata_point_id(),
            vector: vec![0.0; self.inner.dimension],
            payload: PointPayload::Metadata(IndexMetadata::now(complete)),
        };
        self.upsert(vec![point]).await
    }

    fn search_filter(&self, filter: Option<&PointFilter>) -> Filter {
        let mut native = filter
            .and_then(|f| self.translator.translate(f))
            .unwrap_or_default();
        native
            .must_not
            .push(Condition::matches("type", PointPayload::METADATA_TAG.to_string()));
        native
    }
}

#[async_trait]
impl VectorStoreAdapter for QdrantAdapter {
    fn collection_name(&self) -> &str {
        &self.inner.collection_name
    }

    fn dimension(&self) -> usize {
        self.inner.dimension
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delete_by_filter: true,
            filter_scroll: true,
        }
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<bool, VectorStoreError> {
        let inner = self.inner.clone();
        let owned = name.to_string();
        self.collections
            .ensure_once(name, dimension, move || async move {
                inner.create_or_validate(&owned, dimension).await
            })
            .await
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError> {
        if points.is_empty() {
            debug!("No points to upsert");
            return Ok(());
        }
        debug!("Upserting {} points", points.len());

        let mut native = Vec::with_capacity(points.len());
        for point in points {
            point.payload.validate()?;
            let payload = json_to_payload(point.payload.to_json()?)?;
            native.push(PointStruct::new(point.id, point.vector, payload));
        }

        match self.upsert_once(&native).await {
            Err(e) if e.is_not_found() => {
                warn!(
                    "Collection {} missing during upsert, re-ensuring and retrying once",
                    self.inner.collection_name
                );
                self.collections.invalidate(&self.inner.collection_name);
                self.initialize().await?;
                self.upsert_once(&native).await
            }
            other => other,
        }
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<&PointFilter>,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        debug!("Searching for {} similar vectors", limit);

        let mut builder = SearchPointsBuilder::new(&self.inner.collection_name, vector, limit as u64)
            .filter(self.search_filter(filter))
            .with_payload(true);
        if let Some(threshold) = min_score {
            builder = builder.score_threshold(threshold);
        }

        let response = self.inner.client.search_points(builder).await.map_err(classify)?;

        let mut hits = Vec::with_capacity(response.result.len());
        for point in response.result {
            let id = point.id.map(point_id_to_string).unwrap_or_default();
            match PointPayload::from_json(payload_to_json(point.payload)) {
                Ok(PointPayload::Segment(payload)) => hits.push(ScoredPoint {
                    id,
                    score: point.score,
                    payload,
                }),
                Ok(PointPayload::Metadata(_)) => {}
                Err(e) => warn!("Skipping point {} with malformed payload: {}", id, e),
            }
        }

        debug!("Found {} search hits", hits.len());
        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &PointFilter) -> Result<(), VectorStoreError> {
        let Some(native) = self.translator.translate(filter) else {
            return Ok(());
        };
        self.inner
            .client
            .delete_points(
                DeletePointsBuilder::new(&self.inner.collection_name)
                    .points(native)
                    .wait(true),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), VectorStoreError> {
        if !self.collection_exists().await? {
            return Ok(());
        }
        info!("Clearing all points from {}", self.inner.collection_name);
        self.inner
            .client
            .delete_points(
                DeletePointsBuilder::new(&self.inner.collection_name)
                    .points(Filter::default())
                    .wait(true),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_collection(&self) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            info!("Deleting collection: {}", self.inner.collection_name);
            self.inner
                .client
                .delete_collection(&self.inner.collection_name)
                .await
                .map_err(classify)?;
        }
        self.collections.invalidate(&self.inner.collection_name);
        Ok(())
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        self.inner.exists(&self.inner.collection_name).await
    }

    async fn mark_indexing_complete(&self) -> Result<(), VectorStoreError> {
        self.write_metadata(true).await
    }

    async fn mark_indexing_incomplete(&self) -> Result<(), VectorStoreError> {
        self.write_metadata(false).await
    }

    async fn has_indexed_data(&self) -> Result<bool, VectorStoreError> {
        if !self.collection_exists().await? {
            return Ok(false);
        }
        let response = self
            .inner
            .client
            .get_points(
                GetPointsBuilder::new(
                    &self.inner.collection_name,
                    vec![PointId::from(metadata_point_id())],
                )
                .with_payload(true),
            )
            .await
            .map_err(classify)?;

        if let Some(point) = response.result.into_iter().next() {
            if let Ok(PointPayload::Metadata(meta)) =
                PointPayload::from_json(payload_to_json(point.payload))
            {
                return Ok(meta.indexing_complete);
            }
        }

        // Collections written before the metadata point existed.
        let info = self
            .inner
            .client
            .collection_info(&self.inner.collection_name)
            .await
            .map_err(classify)?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .map(|count| count > 0)
            .unwrap_or(false))
    }
}

/// Map a client error onto the adapter taxonomy.
fn classify(err: QdrantError) -> VectorStoreError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("doesn't exist") || lower.contains("does not exist") {
        VectorStoreError::NotFound(message)
    } else if lower.contains("connect") || lower.contains("transport") || lower.contains("unavailable") {
        VectorStoreError::Connection(message)
    } else {
        VectorStoreError::Backend(message)
    }
}

fn point_id_to_string(id: PointId) -> String {
    match id.point_id_options {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn json_to_payload(value: serde_json::Value) -> Result<HashMap<String, Value>, VectorStoreError> {
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, json_to_value(v)))
            .collect()),
        other => Err(VectorStoreError::InvalidPayload(format!(
            "payload must be an object, got {other}"
        ))),
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect(),
        }),
    };
    Value { kind: Some(kind) }
}

fn payload_to_json(payload: HashMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, value_to_json(v)))
            .collect(),
    )
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Value::from(d),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, value_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::filter::path_segments;
    use crate::vector_store::SegmentPayload;

    #[test]
    fn test_resolve_url_default() {
        assert_eq!(resolve_url(None).unwrap(), DEFAULT_QDRANT_URL);
        assert_eq!(resolve_url(Some("  ")).unwrap(), DEFAULT_QDRANT_URL);
    }

    #[test]
    fn test_resolve_url_bare_hostname_is_http_port_80() {
        assert_eq!(resolve_url(Some("qdrant.internal")).unwrap(), "http://qdrant.internal:80");
    }

    #[test]
    fn test_resolve_url_keeps_explicit_parts() {
        assert_eq!(
            resolve_url(Some("https://cloud.example.com")).unwrap(),
            "https://cloud.example.com:443"
        );
        assert_eq!(
            resolve_url(Some("http://localhost:6334/qdrant/")).unwrap(),
            "http://localhost:6334/qdrant"
        );
        assert_eq!(resolve_url(Some("localhost:6334")).unwrap(), "http://localhost:6334");
    }

    #[test]
    fn test_resolve_url_rejects_garbage() {
        assert!(resolve_url(Some("http://")).is_err());
    }

    #[test]
    fn test_collection_name_is_stable_and_suffixed() {
        let root = Path::new("/work/repo");
        let base = collection_name_for(root, None);
        assert!(base.starts_with("ws-"));
        assert_eq!(base.len(), 3 + 16);
        assert_eq!(base, collection_name_for(root, None));
        assert_eq!(collection_name_for(root, Some("")), base);
        assert_eq!(
            collection_name_for(root, Some("Memory Bank!")),
            format!("{base}-memory-bank")
        );
        assert_ne!(base, collection_name_for(Path::new("/work/other"), None));
    }

    #[test]
    fn test_directory_filter_translation() {
        let filter = QdrantFilterTranslator.directory_prefix("src/utils");
        assert_eq!(filter.must.len(), 2);
        assert!(filter.should.is_empty());
    }

    #[test]
    fn test_search_filter_excludes_metadata() {
        let translator = QdrantFilterTranslator;
        let prefix = PointFilter::DirectoryPrefix("src".to_string());
        let mut native = translator.translate(&prefix).unwrap();
        native
            .must_not
            .push(Condition::matches("type", PointPayload::METADATA_TAG.to_string()));
        assert_eq!(native.must.len(), 1);
        assert_eq!(native.must_not.len(), 1);
    }

    #[test]
    fn test_payload_conversion_preserves_nested_segments() {
        let payload = PointPayload::Segment(SegmentPayload {
            file_path: "src/lib.rs".to_string(),
            identifier: Some("run".to_string()),
            kind: "function".to_string(),
            start_line: 4,
            end_line: 12,
            code_chunk: "fn run() {}".to_string(),
            segment_hash: "h".to_string(),
            path_segments: path_segments("src/lib.rs"),
        });

        let native = json_to_payload(payload.to_json().unwrap()).unwrap();
        assert!(native.contains_key("pathSegments"));
        assert!(native.contains_key("type"));

        let restored = PointPayload::from_json(payload_to_json(native)).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_json_to_payload_rejects_non_object() {
        assert!(json_to_payload(serde_json::json!([1, 2])).is_err());
    }
}
