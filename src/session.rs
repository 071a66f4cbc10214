//! Wiring from configuration to a live index session.
//!
//! Builds the embedder, vector store, fingerprint cache, orchestrator and
//! search service for one workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use seekr_config::{resolve_secret, Config};
use seekr_index::fingerprint::MemoryFingerprintStore;
use seekr_index::search::SearchCacheConfig;
use seekr_index::vector_store::qdrant::collection_name_for;
use seekr_index::{
    ContentFingerprintCache, FingerprintStore, HttpEmbedder, HybridConfig, InMemoryVectorStore,
    IndexOrchestrator, JsonFileStore, OrchestratorConfig, QdrantAdapter, QdrantConfig,
    RegexKeywordSearcher, SearchService, TreeSitterParser, VectorStoreAdapter, WorkspaceFs,
};
use tracing::{debug, info};

/// Everything needed to index and query one workspace.
pub struct Session {
    pub root: PathBuf,
    pub config: Config,
    pub store: Arc<dyn VectorStoreAdapter>,
    pub orchestrator: Arc<IndexOrchestrator>,
    pub search: SearchService,
}

impl Session {
    /// `memory` keeps vectors and fingerprints in process instead of Qdrant
    /// and the state directory.
    pub async fn open(root: &Path, config: Config, memory: bool) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Workspace {} does not exist", root.display()))?;
        config.validate().context("Invalid configuration")?;
        info!("Opening workspace {}", root.display());

        let embedder = Arc::new(build_embedder(&config)?);
        let store = build_store(&config, &root, memory)?;
        let fingerprints = Arc::new(open_fingerprints(&config, &root, memory).await?);

        let fs = WorkspaceFs::new(
            root.clone(),
            config.index.extensions.clone(),
            config.index.max_file_size,
        )
        .with_gitignore(config.index.respect_gitignore);
        let parser = TreeSitterParser::new().context("Failed to initialize tree-sitter")?;

        let orchestrator = Arc::new(IndexOrchestrator::new(
            OrchestratorConfig {
                enabled: config.index.enabled,
                files_per_batch: config.index.files_per_batch,
                parse_cache_capacity: config.index.parse_cache_capacity,
                recency_window: config.recency_window(),
            },
            Arc::new(fs),
            Arc::new(parser),
            embedder.clone(),
            store.clone(),
            fingerprints,
        ));

        let search = SearchService::new(
            config.index.enabled,
            orchestrator.subscribe(),
            embedder,
            store.clone(),
            search_cache_config(&config),
        )
        .with_keyword_searcher(Arc::new(RegexKeywordSearcher::default()))
        .with_hybrid_config(hybrid_config(&config));

        Ok(Self {
            root,
            config,
            store,
            orchestrator,
            search,
        })
    }
}

pub fn build_embedder(config: &Config) -> Result<HttpEmbedder> {
    let api_key = resolve_secret(config.embedder.api_key.as_deref())
        .context("Failed to resolve embedder API key")?;
    if api_key.is_none() {
        debug!("No embedder API key configured");
    }
    HttpEmbedder::new(
        &config.embedder.base_url,
        config.embedder.model.clone(),
        config.embedder.dimensions,
        api_key,
        Duration::from_secs(config.embedder.timeout_secs),
    )
}

pub fn build_store(config: &Config, root: &Path, memory: bool) -> Result<Arc<dyn VectorStoreAdapter>> {
    let suffix = config.qdrant.collection_suffix.as_deref();
    let dimension = config.embedder.dimensions;
    if memory {
        return Ok(Arc::new(InMemoryVectorStore::new(
            collection_name_for(root, suffix),
            dimension,
        )));
    }

    let qdrant = QdrantConfig {
        url: config.qdrant.url.clone(),
        api_key: resolve_secret(config.qdrant.api_key.as_deref())
            .context("Failed to resolve Qdrant API key")?,
        timeout: Duration::from_secs(config.qdrant.timeout_secs),
    };
    let adapter = QdrantAdapter::connect(&qdrant, root, suffix, dimension)
        .context("Failed to connect to Qdrant")?;
    Ok(Arc::new(adapter))
}

pub async fn open_fingerprints(config: &Config, root: &Path, memory: bool) -> Result<ContentFingerprintCache> {
    let store: Arc<dyn FingerprintStore> = if memory {
        Arc::new(MemoryFingerprintStore::default())
    } else {
        let state_dir = config
            .fingerprint
            .state_dir()
            .context("No state directory available; set fingerprint.state_dir")?;
        let store = JsonFileStore::for_workspace(&state_dir, root);
        debug!("Fingerprints stored at {}", store.path().display());
        Arc::new(store)
    };
    let cache = ContentFingerprintCache::open(store, Duration::from_millis(config.fingerprint.debounce_ms))
        .await
        .context("Failed to load fingerprint cache")?;
    Ok(cache)
}

fn search_cache_config(config: &Config) -> SearchCacheConfig {
    SearchCacheConfig {
        result_ttl: Duration::from_secs(config.search.result_ttl_secs),
        result_capacity: config.search.result_capacity,
        embedding_ttl: Duration::from_secs(config.search.embedding_ttl_secs),
        embedding_capacity: config.search.embedding_capacity,
    }
}

fn hybrid_config(config: &Config) -> HybridConfig {
    HybridConfig {
        enabled: config.search.hybrid,
        semantic_weight: config.search.semantic_weight,
        keyword_weight: config.search.keyword_weight,
        max_results: config.search.max_results,
        min_score: config.search.min_score,
        rrf_k: config.search.rrf_k,
        keyword_timeout: Duration::from_secs(config.search.keyword_timeout_secs),
    }
}
