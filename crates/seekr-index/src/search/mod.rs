//! Hybrid search combining vector similarity and keyword matches.
//!
//! Semantic hits come from the vector store; keyword matches from a
//! [`KeywordSearcher`] are mapped onto those hits by line range, matches no
//! hit covers become keyword-only results, and the two rankings are merged
//! with Reciprocal Rank Fusion. Query embeddings and
//! final results are cached with a TTL and a capacity bound.

pub mod fusion;

pub use fusion::reciprocal_rank_fusion;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::keyword::{query_to_pattern, KeywordMatch, KeywordSearcher};
use crate::orchestrator::IndexStatus;
use crate::vector_store::filter::normalize_directory_prefix;
use crate::vector_store::{PointFilter, ScoredPoint, VectorStoreAdapter};
use crate::workspace::content_hash;

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Id of the vector point
    pub id: String,
    /// Workspace-relative file path
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// The matching code
    pub content: String,
    /// Kind of code element (function, class, lines, ...)
    pub kind: String,
    pub identifier: Option<String>,
    /// Combined relevance score (higher is better)
    pub score: f32,
    /// Vector similarity component
    pub vector_score: f32,
    /// Keyword matches inside this segment's line range
    pub keyword_hits: usize,
}

/// Configuration for hybrid search.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridConfig {
    /// Fuse keyword matches into the semantic ranking
    pub enabled: bool,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Maximum number of results to return
    pub max_results: usize,
    /// Minimum vector similarity for a hit to be considered
    pub min_score: Option<f32>,
    /// RRF k parameter
    pub rrf_k: f32,
    pub keyword_timeout: Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            max_results: 20,
            min_score: None,
            rrf_k: 60.0,
            keyword_timeout: Duration::from_secs(5),
        }
    }
}

/// Partial update for [`HybridConfig`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct HybridConfigUpdate {
    pub enabled: Option<bool>,
    pub semantic_weight: Option<f32>,
    pub keyword_weight: Option<f32>,
    pub max_results: Option<usize>,
    pub min_score: Option<Option<f32>>,
    pub rrf_k: Option<f32>,
    pub keyword_timeout: Option<Duration>,
}

impl HybridConfig {
    fn apply(&mut self, update: HybridConfigUpdate) {
        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = update.semantic_weight {
            self.semantic_weight = v;
        }
        if let Some(v) = update.keyword_weight {
            self.keyword_weight = v;
        }
        if let Some(v) = update.max_results {
            self.max_results = v.max(1);
        }
        if let Some(v) = update.min_score {
            self.min_score = v;
        }
        if let Some(v) = update.rrf_k {
            self.rrf_k = v;
        }
        if let Some(v) = update.keyword_timeout {
            self.keyword_timeout = v;
        }
    }
}

/// TTL and capacity of the two search caches.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCacheConfig {
    pub result_ttl: Duration,
    pub result_capacity: u64,
    pub embedding_ttl: Duration,
    pub embedding_capacity: u64,
}

impl Default for SearchCacheConfig {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(600),
            result_capacity: 100,
            embedding_ttl: Duration::from_secs(3600),
            embedding_capacity: 1000,
        }
    }
}

/// Entry counts and hit/miss counters of the search caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub result_entries: u64,
    pub embedding_entries: u64,
    pub result_hits: u64,
    pub result_misses: u64,
    pub embedding_hits: u64,
    pub embedding_misses: u64,
}

#[derive(Default)]
struct Counters {
    result_hits: AtomicU64,
    result_misses: AtomicU64,
    embedding_hits: AtomicU64,
    embedding_misses: AtomicU64,
}

/// Query entry point over one workspace's index.
pub struct SearchService {
    enabled: bool,
    status: watch::Receiver<IndexStatus>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStoreAdapter>,
    keyword: Option<Arc<dyn KeywordSearcher>>,
    config: RwLock<HybridConfig>,
    results: Cache<String, Arc<Vec<SearchResult>>>,
    embeddings: Cache<String, Arc<Vec<f32>>>,
    counters: Counters,
}

impl SearchService {
    /// `status` is the orchestrator's progress channel; queries are
    /// rejected unless it reports a searchable state.
    pub fn new(
        enabled: bool,
        status: watch::Receiver<IndexStatus>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStoreAdapter>,
        caches: SearchCacheConfig,
    ) -> Self {
        Self {
            enabled,
            status,
            embedder,
            store,
            keyword: None,
            config: RwLock::new(HybridConfig::default()),
            results: Cache::builder()
                .max_capacity(caches.result_capacity)
                .time_to_live(caches.result_ttl)
                .build(),
            embeddings: Cache::builder()
                .max_capacity(caches.embedding_capacity)
                .time_to_live(caches.embedding_ttl)
                .build(),
            counters: Counters::default(),
        }
    }

    pub fn with_keyword_searcher(mut self, searcher: Arc<dyn KeywordSearcher>) -> Self {
        self.keyword = Some(searcher);
        self
    }

    pub fn with_hybrid_config(self, config: HybridConfig) -> Self {
        if let Ok(mut current) = self.config.write() {
            *current = config;
        }
        self
    }

    pub fn hybrid_config(&self) -> HybridConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Search the index for `query`, optionally scoped to a directory.
    ///
    /// When hybrid search is on and `workspace_root` is given, keyword
    /// matches are fused in; a failing or slow keyword search degrades to
    /// semantic-only results instead of failing the query.
    pub async fn search(
        &self,
        query: &str,
        directory_prefix: Option<&str>,
        workspace_root: Option<&Path>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if !self.enabled {
            return Err(IndexError::Configuration("code search is disabled".to_string()));
        }
        let state = self.status.borrow().state;
        if !state.is_searchable() {
            return Err(IndexError::SearchUnavailable {
                state: state.to_string(),
            });
        }
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let prefix = directory_prefix.and_then(normalize_directory_prefix);
        let key = result_key(query, prefix.as_deref());
        if let Some(cached) = self.results.get(&key).await {
            self.counters.result_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Search cache hit for '{}'", query);
            return Ok(cached.as_ref().clone());
        }
        self.counters.result_misses.fetch_add(1, Ordering::Relaxed);

        let config = self.hybrid_config();
        let vector = self.query_embedding(query).await?;
        let filter = prefix.clone().map(PointFilter::DirectoryPrefix);
        let hybrid = config.enabled && self.keyword.is_some() && workspace_root.is_some();
        let fetch_limit = if hybrid {
            config.max_results * 3
        } else {
            config.max_results
        };

        let hits = self
            .store
            .search(vector, fetch_limit, filter.as_ref(), config.min_score)
            .await?;
        debug!("Vector search returned {} hits for '{}'", hits.len(), query);

        let keyword_matches = match (hybrid, workspace_root) {
            (true, Some(root)) => {
                self.keyword_matches(query, prefix.as_deref(), root, config.keyword_timeout)
                    .await
            }
            _ => None,
        };

        let results = match keyword_matches {
            Some(matches) => fuse(&hits, &matches, &config),
            None => semantic_only(&hits, config.max_results),
        };

        self.results.insert(key, Arc::new(results.clone())).await;
        Ok(results)
    }

    /// Update the hybrid settings. Cached results were ranked under the old
    /// settings, so the result cache is dropped.
    pub fn set_hybrid_config(&self, update: HybridConfigUpdate) {
        if let Ok(mut config) = self.config.write() {
            config.apply(update);
            info!("Hybrid search config updated: {:?}", *config);
        }
        self.results.invalidate_all();
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.results.run_pending_tasks().await;
        self.embeddings.run_pending_tasks().await;
        CacheStats {
            result_entries: self.results.entry_count(),
            embedding_entries: self.embeddings.entry_count(),
            result_hits: self.counters.result_hits.load(Ordering::Relaxed),
            result_misses: self.counters.result_misses.load(Ordering::Relaxed),
            embedding_hits: self.counters.embedding_hits.load(Ordering::Relaxed),
            embedding_misses: self.counters.embedding_misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear_caches(&self) {
        self.results.invalidate_all();
        self.embeddings.invalidate_all();
        debug!("Search caches cleared");
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>, IndexError> {
        let key = content_hash(query.as_bytes());
        if let Some(vector) = self.embeddings.get(&key).await {
            self.counters.embedding_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector.as_ref().clone());
        }
        self.counters.embedding_misses.fetch_add(1, Ordering::Relaxed);

        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| IndexError::Embedding(format!("{:#}", e)))?;
        self.embeddings.insert(key, Arc::new(vector.clone())).await;
        Ok(vector)
    }

    /// `None` when keyword search is unusable for this query.
    async fn keyword_matches(
        &self,
        query: &str,
        prefix: Option<&str>,
        root: &Path,
        timeout: Duration,
    ) -> Option<Vec<KeywordMatch>> {
        let searcher = self.keyword.as_ref()?;
        let pattern = query_to_pattern(query)?;
        let directory = match prefix {
            Some(p) => root.join(p),
            None => root.to_path_buf(),
        };

        match tokio::time::timeout(timeout, searcher.grep(&pattern, &directory, root)).await {
            Ok(Ok(matches)) => Some(matches),
            Ok(Err(e)) => {
                warn!("Keyword search failed, using semantic results only: {:#}", e);
                None
            }
            Err(_) => {
                warn!(
                    "Keyword search timed out after {:?}, using semantic results only",
                    timeout
                );
                None
            }
        }
    }
}

fn result_key(query: &str, prefix: Option<&str>) -> String {
    content_hash(format!("{}\u{0}{}", query, prefix.unwrap_or("")).as_bytes())
}

fn to_result(hit: &ScoredPoint, score: f32, keyword_hits: usize) -> SearchResult {
    SearchResult {
        id: hit.id.clone(),
        file_path: hit.payload.file_path.clone(),
        start_line: hit.payload.start_line,
        end_line: hit.payload.end_line,
        content: hit.payload.code_chunk.clone(),
        kind: hit.payload.kind.clone(),
        identifier: hit.payload.identifier.clone(),
        score,
        vector_score: hit.score,
        keyword_hits,
    }
}

fn semantic_only(hits: &[ScoredPoint], limit: usize) -> Vec<SearchResult> {
    hits.iter()
        .take(limit)
        .map(|hit| to_result(hit, hit.score, 0))
        .collect()
}

fn keyword_result(candidate: &fusion::KeywordCandidate, score: f32) -> SearchResult {
    SearchResult {
        id: candidate.id.clone(),
        file_path: candidate.file_path.clone(),
        start_line: candidate.start_line,
        end_line: candidate.end_line,
        content: candidate.lines.join("\n"),
        kind: "keyword".to_string(),
        identifier: None,
        score,
        vector_score: 0.0,
        keyword_hits: candidate.lines.len(),
    }
}

fn fuse(hits: &[ScoredPoint], matches: &[KeywordMatch], config: &HybridConfig) -> Vec<SearchResult> {
    let counts = fusion::keyword_hits_per_point(hits, matches);
    let candidates = fusion::keyword_only_candidates(hits, matches);
    let semantic: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
    let keyword = fusion::keyword_ranking(hits, &counts, &candidates);
    let fused = reciprocal_rank_fusion(
        &semantic,
        &keyword,
        config.rrf_k,
        config.semantic_weight,
        config.keyword_weight,
    );

    fused
        .into_iter()
        .filter_map(|(id, score)| {
            if let Some(hit) = hits.iter().find(|h| h.id == id) {
                return Some(to_result(hit, score, counts.get(&id).copied().unwrap_or(0)));
            }
            candidates
                .iter()
                .find(|c| c.id == id)
                .map(|c| keyword_result(c, score))
        })
        .take(config.max_results)
        .collect()
}
