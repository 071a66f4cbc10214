//! In-process vector store.
//!
//! Brute-force cosine search over a map of points. Backs the CLI's offline
//! mode and the test suite. Call counters and failure switches are only
//! compiled for tests and the `test-util` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    metadata_point_id, Capabilities, CollectionManager, IndexMetadata, PointFilter, PointPayload,
    ScoredPoint, VectorPoint, VectorStoreAdapter, VectorStoreError,
};

#[derive(Default)]
struct Collection {
    dimension: usize,
    points: HashMap<String, (Vec<f32>, PointPayload)>,
}

#[derive(Default)]
struct Counters {
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    fail_initialize: AtomicBool,
    fail_upsert: AtomicBool,
}

/// [`VectorStoreAdapter`] kept entirely in memory.
pub struct InMemoryVectorStore {
    name: String,
    dimension: usize,
    collections: Arc<RwLock<HashMap<String, Collection>>>,
    manager: CollectionManager,
    counters: Arc<Counters>,
}

impl InMemoryVectorStore {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            collections: Arc::new(RwLock::new(HashMap::new())),
            manager: CollectionManager::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Number of segment points (metadata excluded).
    pub fn point_count(&self) -> usize {
        self.read()
            .get(&self.name)
            .map(|c| {
                c.points
                    .values()
                    .filter(|(_, p)| matches!(p, PointPayload::Segment(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Distinct file paths with at least one point, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .read()
            .get(&self.name)
            .map(|c| {
                c.points
                    .values()
                    .filter_map(|(_, p)| match p {
                        PointPayload::Segment(s) => Some(s.file_path.clone()),
                        PointPayload::Metadata(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths.dedup();
        paths
    }

    #[cfg(any(test, feature = "test-util"))]
    /// How many times a collection was physically created.
    pub fn create_calls(&self) -> usize {
        self.counters.create_calls.load(Ordering::SeqCst)
    }

    #[cfg(any(test, feature = "test-util"))]
    /// How many filtered deletes reached the store.
    pub fn delete_calls(&self) -> usize {
        self.counters.delete_calls.load(Ordering::SeqCst)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_calls(&self) -> usize {
        self.counters.clear_calls.load(Ordering::SeqCst)
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Make collection setup fail until switched off.
    pub fn set_fail_initialize(&self, fail: bool) {
        self.counters.fail_initialize.store(fail, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Make upserts fail until switched off.
    pub fn set_fail_upsert(&self, fail: bool) {
        self.counters.fail_upsert.store(fail, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-util"))]
    /// Drop the collection behind the adapter's back, as a server restart
    /// would.
    pub fn drop_collection_externally(&self) {
        self.write().remove(&self.name);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Collection>> {
        self.collections.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection>> {
        self.collections.write().unwrap_or_else(|p| p.into_inner())
    }

    fn write_metadata(&self, complete: bool) -> Result<(), VectorStoreError> {
        let mut collections = self.write();
        let collection = collections
            .get_mut(&self.name)
            .ok_or_else(|| VectorStoreError::NotFound(self.name.clone()))?;
        let vector = vec![0.0; collection.dimension];
        collection.points.insert(
            metadata_point_id(),
            (vector, PointPayload::Metadata(IndexMetadata::now(complete))),
        );
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorStoreAdapter for InMemoryVectorStore {
    fn collection_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            delete_by_filter: true,
            filter_scroll: true,
        }
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<bool, VectorStoreError> {
        let collections = self.collections.clone();
        let counters = self.counters.clone();
        let owned = name.to_string();
        self.manager
            .ensure_once(name, dimension, move || async move {
                if counters.fail_initialize.load(Ordering::SeqCst) {
                    return Err(VectorStoreError::Connection("vector store unreachable".to_string()));
                }
                let mut collections = collections.write().unwrap_or_else(|p| p.into_inner());
                match collections.get(&owned) {
                    Some(existing) if existing.dimension == dimension => Ok(false),
                    _ => {
                        counters.create_calls.fetch_add(1, Ordering::SeqCst);
                        collections.insert(
                            owned,
                            Collection {
                                dimension,
                                points: HashMap::new(),
                            },
                        );
                        Ok(true)
                    }
                }
            })
            .await
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError> {
        if self.counters.fail_upsert.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Backend("upsert rejected".to_string()));
        }
        for point in &points {
            point.payload.validate()?;
        }

        let attempt = |points: &[VectorPoint]| -> Result<(), VectorStoreError> {
            let mut collections = self.write();
            let collection = collections
                .get_mut(&self.name)
                .ok_or_else(|| VectorStoreError::NotFound(self.name.clone()))?;
            for point in points {
                if point.vector.len() != collection.dimension {
                    return Err(VectorStoreError::InvalidPayload(format!(
                        "vector of length {} in a collection of dimension {}",
                        point.vector.len(),
                        collection.dimension
                    )));
                }
            }
            for point in points {
                collection
                    .points
                    .insert(point.id.clone(), (point.vector.clone(), point.payload.clone()));
            }
            Ok(())
        };

        match attempt(&points) {
            Err(e) if e.is_not_found() => {
                debug!("Collection {} missing during upsert, re-ensuring", self.name);
                self.manager.invalidate(&self.name);
                self.initialize().await?;
                attempt(&points)
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
        let collections = self.read();
        let collection = collections
            .get(&self.name)
            .ok_or_else(|| VectorStoreError::NotFound(self.name.clone()))?;

        let mut hits: Vec<ScoredPoint> = collection
            .points
            .iter()
            .filter_map(|(id, (v, payload))| match payload {
                PointPayload::Segment(segment) => Some((id, v, segment)),
                PointPayload::Metadata(_) => None,
            })
            .filter(|(_, _, segment)| filter.map_or(true, |f| f.matches(segment)))
            .map(|(id, v, segment)| ScoredPoint {
                id: id.clone(),
                score: cosine(&vector, v),
                payload: segment.clone(),
            })
            .filter(|hit| min_score.map_or(true, |min| hit.score >= min))
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_filter(&self, filter: &PointFilter) -> Result<(), VectorStoreError> {
        self.counters.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.write();
        if let Some(collection) = collections.get_mut(&self.name) {
            collection.points.retain(|_, (_, payload)| match payload {
                PointPayload::Segment(segment) => !filter.matches(segment),
                PointPayload::Metadata(_) => true,
            });
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), VectorStoreError> {
        self.counters.clear_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(collection) = self.write().get_mut(&self.name) {
            collection.points.clear();
        }
        Ok(())
    }

    async fn delete_collection(&self) -> Result<(), VectorStoreError> {
        self.write().remove(&self.name);
        self.manager.invalidate(&self.name);
        Ok(())
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        Ok(self.read().contains_key(&self.name))
    }

    async fn mark_indexing_complete(&self) -> Result<(), VectorStoreError> {
        self.write_metadata(true)
    }

    async fn mark_indexing_incomplete(&self) -> Result<(), VectorStoreError> {
        self.write_metadata(false)
    }

    async fn has_indexed_data(&self) -> Result<bool, VectorStoreError> {
        let collections = self.read();
        let Some(collection) = collections.get(&self.name) else {
            return Ok(false);
        };
        match collection.points.get(&metadata_point_id()) {
            Some((_, PointPayload::Metadata(meta))) => Ok(meta.indexing_complete),
            _ => Ok(collection
                .points
                .values()
                .any(|(_, p)| matches!(p, PointPayload::Segment(_)))),
        }
    }
}
