//! Index orchestrator.
//!
//! Drives a workspace through `Standby → Scanning → Indexing → Indexed`:
//! diff the tree against stored fingerprints, remove vectors of deleted
//! files, then parse, embed and upsert changed files in priority order.
//! Fingerprints move only after the vector store has accepted a write.
//!
//! Destructive cleanup on failure is gated on the vector store having been
//! initialized in the current run, so an unreachable backend never wipes a
//! previously good index.

mod priority;
mod scan;
mod status;

pub use priority::{priority_for, sort_by_priority, FilePriority, IndexedFileRecord};
pub use scan::{diff_against_fingerprints, ScanDiff};
pub use status::{IndexState, IndexStats, IndexStatus};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::branch::BranchChangeListener;
use crate::embeddings::Embedder;
use crate::error::IndexError;
use crate::fingerprint::ContentFingerprintCache;
use crate::parse_cache::{ParseCache, ParseCacheEntry};
use crate::parser::CodeParser;
use crate::vector_store::{VectorPoint, VectorStoreAdapter};
use crate::watcher::FileEvent;
use crate::workspace::{content_hash, extension_of, parent_dir, FileSystem};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Master switch; a disabled orchestrator refuses to index
    pub enabled: bool,
    /// Files parsed, embedded and upserted together
    pub files_per_batch: usize,
    pub parse_cache_capacity: usize,
    /// Files indexed this recently are scheduled ahead of untouched ones
    pub recency_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            files_per_batch: 10,
            parse_cache_capacity: crate::DEFAULT_PARSE_CACHE_CAPACITY,
            recency_window: Duration::from_secs(300),
        }
    }
}

/// Cancellation scope of one run. A run is stale once its token is
/// cancelled or the orchestrator has moved to a newer generation.
struct RunContext {
    token: CancellationToken,
    generation: u64,
}

/// Coordinates scanning, change detection and vector-store writes for one
/// workspace.
pub struct IndexOrchestrator {
    config: OrchestratorConfig,
    fs: Arc<dyn FileSystem>,
    parser: Arc<dyn CodeParser>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStoreAdapter>,
    fingerprints: Arc<ContentFingerprintCache>,
    parse_cache: Mutex<ParseCache>,
    records: RwLock<HashMap<String, IndexedFileRecord>>,
    open_files: RwLock<HashSet<String>>,
    status: watch::Sender<IndexStatus>,
    // One run (full scan, batch or live update) at a time.
    run_lock: Mutex<()>,
    // Watcher events that arrived while a run was scanning or indexing.
    pending_events: std::sync::Mutex<Vec<FileEvent>>,
    cancel: std::sync::Mutex<CancellationToken>,
    generation: AtomicU64,
}

impl IndexOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        fs: Arc<dyn FileSystem>,
        parser: Arc<dyn CodeParser>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStoreAdapter>,
        fingerprints: Arc<ContentFingerprintCache>,
    ) -> Self {
        let (status, _) = watch::channel(IndexStatus::default());
        Self {
            parse_cache: Mutex::new(ParseCache::new(config.parse_cache_capacity)),
            config,
            fs,
            parser,
            embedder,
            store,
            fingerprints,
            records: RwLock::new(HashMap::new()),
            open_files: RwLock::new(HashSet::new()),
            status,
            run_lock: Mutex::new(()),
            pending_events: std::sync::Mutex::new(Vec::new()),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Incremental scan: index what changed since the last run.
    pub async fn start_indexing(&self) -> Result<IndexStats, IndexError> {
        self.run(false).await
    }

    /// Drop every vector and fingerprint, then index the whole tree.
    pub async fn force_reindex(&self) -> Result<IndexStats, IndexError> {
        self.run(true).await
    }

    /// Interrupt the current run at the next file boundary.
    pub fn stop_indexing(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
        info!("Stop requested");
    }

    pub fn get_status(&self) -> IndexStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> IndexState {
        self.status.borrow().state
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<IndexStatus> {
        self.status.subscribe()
    }

    pub fn fingerprints(&self) -> &Arc<ContentFingerprintCache> {
        &self.fingerprints
    }

    pub fn store(&self) -> &Arc<dyn VectorStoreAdapter> {
        &self.store
    }

    /// Stop any run and flush fingerprints.
    pub async fn dispose(&self) {
        self.stop_indexing();
        let _guard = self.run_lock.lock().await;
        self.fingerprints.dispose().await;
    }

    pub async fn mark_file_open(&self, path: &str) {
        self.open_files.write().await.insert(path.to_string());
        self.refresh_priorities(path).await;
    }

    pub async fn mark_file_closed(&self, path: &str) {
        self.open_files.write().await.remove(path);
        self.refresh_priorities(path).await;
    }

    pub async fn calculate_file_priority(&self, path: &str) -> FilePriority {
        let open = self.open_files.read().await;
        let last_indexed = self
            .records
            .read()
            .await
            .get(path)
            .map(|r| r.last_indexed_at);
        priority_for(
            path,
            &open,
            last_indexed,
            SystemTime::now(),
            self.config.recency_window,
        )
    }

    /// Scheduling record for `path`, if it has been indexed.
    pub async fn record(&self, path: &str) -> Option<IndexedFileRecord> {
        self.records.read().await.get(path).cloned()
    }

    /// Parse, embed and upsert `paths`, most urgent first.
    pub async fn process_files_by_priority(&self, paths: Vec<String>) -> Result<IndexStats, IndexError> {
        let _guard = self.run_lock.lock().await;
        let ctx = self.begin_run();
        let mut stats = IndexStats::default();
        self.process_changed(paths, &ctx, &mut stats).await?;
        Ok(stats)
    }

    /// Segments for `path`, reusing the last parse while the content hash
    /// is unchanged.
    pub async fn get_or_parse_file(&self, path: &str) -> Result<ParseCacheEntry, IndexError> {
        let bytes = self.fs.read(path).await.map_err(|e| IndexError::Io {
            path: path.to_string(),
            source: e,
        })?;
        let hash = content_hash(&bytes);

        if let Some(entry) = self.parse_cache.lock().await.get(path, &hash) {
            debug!("Parse cache hit for {}", path);
            return Ok(entry);
        }

        let source = String::from_utf8(bytes).map_err(|_| IndexError::Parse {
            path: path.to_string(),
            message: "file is not valid UTF-8".to_string(),
        })?;
        let segments = self.parser.parse(path, &source, &hash)?;
        debug!("Parsed {} into {} segments", path, segments.len());

        let entry = ParseCacheEntry {
            path: path.to_string(),
            content_hash: hash,
            segments,
        };
        self.parse_cache.lock().await.insert(entry.clone());
        Ok(entry)
    }

    /// Apply debounced watcher events to an indexed workspace.
    ///
    /// Events that arrive while a run is scanning or indexing are queued and
    /// applied once that run reaches `Indexed`; the scan may already have
    /// read the old content. In `Standby` or `Error` they are dropped, since
    /// the next run rescans the tree. A vector-store failure moves the
    /// orchestrator to `Error` without clearing anything; fingerprints of the
    /// affected files are left alone so the next scan retries them.
    pub async fn apply_file_events(&self, events: &[FileEvent]) -> Result<IndexStats, IndexError> {
        if let Ok(mut pending) = self.pending_events.lock() {
            let state = self.state();
            if matches!(state, IndexState::Scanning | IndexState::Indexing) {
                debug!("Queueing {} file events until the run finishes", events.len());
                pending.extend_from_slice(events);
                return Ok(IndexStats::default());
            }
            if state != IndexState::Indexed {
                debug!("Ignoring {} file events while {}", events.len(), state);
                return Ok(IndexStats::default());
            }
        }
        let _guard = self.run_lock.lock().await;
        let ctx = self.begin_run();
        self.apply_events_locked(events, &ctx).await
    }

    /// Apply events queued during a run. Called with the run lock held.
    async fn drain_pending_events(&self, ctx: &RunContext) {
        loop {
            let events = match self.pending_events.lock() {
                Ok(mut pending) => std::mem::take(&mut *pending),
                Err(_) => return,
            };
            if events.is_empty() {
                return;
            }
            info!("Applying {} file events queued during indexing", events.len());
            if let Err(e) = self.apply_events_locked(&events, ctx).await {
                warn!("Failed to apply queued file events: {}", e);
                return;
            }
        }
    }

    async fn apply_events_locked(
        &self,
        events: &[FileEvent],
        ctx: &RunContext,
    ) -> Result<IndexStats, IndexError> {
        let mut touched = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for event in events {
            match event {
                FileEvent::Created(p) | FileEvent::Modified(p) => {
                    removed.remove(p);
                    touched.insert(p.clone());
                }
                FileEvent::Deleted(p) => {
                    touched.remove(p);
                    removed.insert(p.clone());
                }
                FileEvent::Renamed(old, new) => {
                    touched.remove(old);
                    removed.insert(old.clone());
                    removed.remove(new);
                    touched.insert(new.clone());
                }
            }
        }

        let mut stats = IndexStats::default();
        let mut changed = Vec::new();
        for path in touched {
            match self.fs.read(&path).await {
                Ok(bytes) => {
                    let hash = content_hash(&bytes);
                    if self.fingerprints.get(&path).await.as_deref() != Some(hash.as_str()) {
                        changed.push(path);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    removed.insert(path);
                }
                Err(e) => {
                    warn!("Skipping unreadable {}: {}", path, e);
                    stats.files_skipped += 1;
                }
            }
        }

        let mut deleted = Vec::new();
        for path in removed {
            if self.fingerprints.get(&path).await.is_some() {
                deleted.push(path);
            }
        }

        if changed.is_empty() && deleted.is_empty() {
            return Ok(stats);
        }
        info!(
            "Applying file changes: {} changed, {} deleted",
            changed.len(),
            deleted.len()
        );
        stats.files_changed = changed.len();
        stats.files_deleted = deleted.len();
        let total = changed.len() + deleted.len();
        self.status.send_modify(|s| {
            s.processed = 0;
            s.total = total;
        });

        let result = async {
            if !deleted.is_empty() {
                self.remove_deleted(&deleted).await?;
                self.advance(deleted.len());
            }
            self.process_changed(changed, ctx, &mut stats).await
        }
        .await;

        match result {
            Ok(()) => Ok(stats),
            Err(IndexError::Cancelled) => Err(IndexError::Cancelled),
            Err(e) => {
                self.set_error(&e);
                Err(e)
            }
        }
    }

    async fn run(&self, force: bool) -> Result<IndexStats, IndexError> {
        let _guard = self.run_lock.lock().await;
        let started_at = Instant::now();
        let ctx = self.begin_run();

        if let Err(e) = self.check_configuration() {
            self.set_error(&e);
            return Err(e);
        }
        self.set_state(IndexState::Scanning, "Scanning workspace");

        let mut indexing_started = false;
        let mut stats = IndexStats::default();
        match self
            .execute(force, &ctx, &mut indexing_started, &mut stats)
            .await
        {
            Ok(()) => {
                stats.duration_ms = started_at.elapsed().as_millis() as u64;
                info!("Indexing complete: {:?}", stats);
                self.drain_pending_events(&ctx).await;
                Ok(stats)
            }
            Err(IndexError::Cancelled) => {
                info!("Indexing stopped before completion");
                self.set_state(IndexState::Standby, "Indexing stopped");
                Err(IndexError::Cancelled)
            }
            Err(e) => {
                if indexing_started {
                    self.cleanup_after_failure().await;
                } else {
                    warn!("Indexing failed before touching the index, leaving it as is");
                }
                self.set_error(&e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        force: bool,
        ctx: &RunContext,
        indexing_started: &mut bool,
        stats: &mut IndexStats,
    ) -> Result<(), IndexError> {
        let collection = self.store.collection_name().to_string();
        let created = self
            .store
            .initialize()
            .await
            .map_err(|e| IndexError::from_init(&collection, e))?;
        *indexing_started = true;
        self.check(ctx)?;

        if created || force {
            if created {
                info!("Collection {} is new, starting a full scan", collection);
            } else {
                info!("Forced reindex, clearing collection {}", collection);
                self.store.clear_all().await?;
            }
            self.fingerprints.clear().await?;
            self.records.write().await.clear();
        }
        self.store.mark_indexing_incomplete().await?;

        let current = self.hash_workspace(ctx, stats).await?;
        let stored = self.fingerprints.get_all().await;
        let diff = diff_against_fingerprints(&stored, &current);
        self.rebuild_records().await;

        stats.files_scanned = current.len();
        stats.files_changed = diff.changed.len();
        stats.files_deleted = diff.deleted.len();
        info!(
            "Scanned {} files: {} changed, {} deleted",
            current.len(),
            diff.changed.len(),
            diff.deleted.len()
        );

        let mut file_type_stats: BTreeMap<String, usize> = BTreeMap::new();
        for path in current.keys() {
            *file_type_stats.entry(extension_of(path)).or_default() += 1;
        }
        let total = diff.changed.len() + diff.deleted.len();
        self.status.send_modify(|s| {
            s.state = IndexState::Indexing;
            s.message = format!("Indexing {} changed files", diff.changed.len());
            s.processed = 0;
            s.total = total;
            s.file_type_stats = file_type_stats;
        });

        if !diff.deleted.is_empty() {
            self.remove_deleted(&diff.deleted).await?;
            self.advance(diff.deleted.len());
        }
        self.process_changed(diff.changed, ctx, stats).await?;
        self.check(ctx)?;

        self.store.mark_indexing_complete().await?;
        self.set_state(
            IndexState::Indexed,
            &format!("Indexed {} files", current.len()),
        );
        Ok(())
    }

    /// Hash every listed file. Unreadable files keep their stored hash so
    /// they are neither reindexed nor treated as deleted.
    async fn hash_workspace(
        &self,
        ctx: &RunContext,
        stats: &mut IndexStats,
    ) -> Result<HashMap<String, String>, IndexError> {
        let paths = self.fs.list().await.map_err(|e| IndexError::Io {
            path: self.fs.root().display().to_string(),
            source: e,
        })?;

        let mut current = HashMap::with_capacity(paths.len());
        for path in paths {
            self.check(ctx)?;
            match self.fs.read(&path).await {
                Ok(bytes) => {
                    current.insert(path, content_hash(&bytes));
                }
                Err(e) => {
                    warn!("Skipping unreadable {}: {}", path, e);
                    stats.files_skipped += 1;
                    if let Some(previous) = self.fingerprints.get(&path).await {
                        current.insert(path, previous);
                    }
                }
            }
        }
        Ok(current)
    }

    /// Delete vectors of removed files, then their fingerprints. The
    /// fingerprints follow the store even if the run has gone stale, since
    /// the vectors are already gone.
    async fn remove_deleted(&self, paths: &[String]) -> Result<(), IndexError> {
        debug!("Removing {} deleted files from the index", paths.len());
        self.store.delete_points_by_multiple_file_paths(paths).await?;
        self.fingerprints.delete_many(paths.to_vec()).await?;

        let mut records = self.records.write().await;
        let mut cache = self.parse_cache.lock().await;
        for path in paths {
            records.remove(path);
            cache.remove(path);
        }
        Ok(())
    }

    async fn process_changed(
        &self,
        paths: Vec<String>,
        ctx: &RunContext,
        stats: &mut IndexStats,
    ) -> Result<(), IndexError> {
        let ordered = self.prioritize(paths).await;
        for batch in ordered.chunks(self.config.files_per_batch.max(1)) {
            self.check(ctx)?;
            self.process_batch(batch, ctx, stats).await?;
        }
        Ok(())
    }

    async fn prioritize(&self, paths: Vec<String>) -> Vec<String> {
        let open = self.open_files.read().await.clone();
        let records = self.records.read().await;
        let now = SystemTime::now();

        let mut ranked: Vec<(String, FilePriority)> = paths
            .into_iter()
            .map(|path| {
                let last = records.get(&path).map(|r| r.last_indexed_at);
                let priority = priority_for(&path, &open, last, now, self.config.recency_window);
                (path, priority)
            })
            .collect();
        sort_by_priority(&mut ranked);
        ranked.into_iter().map(|(path, _)| path).collect()
    }

    async fn process_batch(
        &self,
        batch: &[String],
        ctx: &RunContext,
        stats: &mut IndexStats,
    ) -> Result<(), IndexError> {
        let mut parsed: Vec<ParseCacheEntry> = Vec::with_capacity(batch.len());
        for path in batch {
            self.check(ctx)?;
            match self.get_or_parse_file(path).await {
                Ok(entry) => parsed.push(entry),
                Err(e) if e.is_file_level() => {
                    warn!("Skipping {}: {}", path, e);
                    stats.files_skipped += 1;
                    self.advance(1);
                }
                Err(e) => return Err(e),
            }
        }
        if parsed.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = parsed
            .iter()
            .flat_map(|entry| entry.segments.iter().map(|s| s.content.clone()))
            .collect();

        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            stats.embedding_calls += 1;
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == texts.len() => vectors,
                Ok(vectors) => {
                    warn!(
                        "Embedder returned {} vectors for {} segments, skipping batch",
                        vectors.len(),
                        texts.len()
                    );
                    stats.batches_failed += 1;
                    self.advance(parsed.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Embedding failed for a batch of {} files, retrying on next scan: {:#}",
                        parsed.len(),
                        e
                    );
                    stats.batches_failed += 1;
                    self.advance(parsed.len());
                    return Ok(());
                }
            }
        };
        // Results computed for a superseded run are dropped here.
        self.check(ctx)?;

        let mut previously_indexed = Vec::new();
        for entry in &parsed {
            if self.fingerprints.get(&entry.path).await.is_some() {
                previously_indexed.push(entry.path.clone());
            }
        }
        self.store
            .delete_points_by_multiple_file_paths(&previously_indexed)
            .await?;

        let points: Vec<VectorPoint> = parsed
            .iter()
            .flat_map(|entry| entry.segments.iter())
            .zip(vectors)
            .map(|(segment, vector)| VectorPoint::for_segment(segment, vector))
            .collect();
        let upserted = points.len();
        if !points.is_empty() {
            self.store.upsert(points).await?;
        }
        stats.segments_upserted += upserted;

        self.check(ctx)?;
        self.fingerprints
            .set_many(
                parsed
                    .iter()
                    .map(|e| (e.path.clone(), e.content_hash.clone()))
                    .collect::<Vec<_>>(),
            )
            .await?;

        let now = SystemTime::now();
        {
            let open = self.open_files.read().await;
            let mut records = self.records.write().await;
            for entry in &parsed {
                let priority = priority_for(&entry.path, &open, Some(now), now, self.config.recency_window);
                records.insert(
                    entry.path.clone(),
                    IndexedFileRecord {
                        path: entry.path.clone(),
                        content_hash: entry.content_hash.clone(),
                        last_indexed_at: now,
                        priority,
                    },
                );
            }
        }

        stats.files_processed += parsed.len();
        self.advance(parsed.len());
        debug!("Indexed batch of {} files ({} segments)", parsed.len(), upserted);
        Ok(())
    }

    async fn rebuild_records(&self) {
        let entries = self.fingerprints.entries().await;
        let open = self.open_files.read().await;
        let now = SystemTime::now();
        let mut records = self.records.write().await;
        records.clear();
        for entry in entries {
            let priority = priority_for(
                &entry.path,
                &open,
                Some(entry.stored_at),
                now,
                self.config.recency_window,
            );
            records.insert(
                entry.path.clone(),
                IndexedFileRecord {
                    path: entry.path,
                    content_hash: entry.hash,
                    last_indexed_at: entry.stored_at,
                    priority,
                },
            );
        }
    }

    /// Recompute priorities of records in `path`'s directory.
    async fn refresh_priorities(&self, path: &str) {
        let open = self.open_files.read().await;
        let dir = parent_dir(path);
        let now = SystemTime::now();
        let mut records = self.records.write().await;
        for record in records.values_mut().filter(|r| parent_dir(&r.path) == dir) {
            record.priority = priority_for(
                &record.path,
                &open,
                Some(record.last_indexed_at),
                now,
                self.config.recency_window,
            );
        }
    }

    async fn cleanup_after_failure(&self) {
        warn!("Indexing failed after the vector store was initialized, clearing index state");
        if let Err(e) = self.store.clear_all().await {
            error!("Failed to clear vector collection: {}", e);
        }
        if let Err(e) = self.fingerprints.clear().await {
            error!("Failed to clear fingerprint cache: {}", e);
        }
        self.parse_cache.lock().await.clear();
        self.records.write().await.clear();
    }

    fn check_configuration(&self) -> Result<(), IndexError> {
        if !self.config.enabled {
            return Err(IndexError::Configuration("indexing is disabled".to_string()));
        }
        let dimensions = self.embedder.dimensions();
        if dimensions == 0 {
            return Err(IndexError::Configuration(format!(
                "embedder {} reports zero dimensions",
                self.embedder.model_name()
            )));
        }
        if dimensions != self.store.dimension() {
            return Err(IndexError::Configuration(format!(
                "embedder {} produces {} dimensions but the vector store expects {}",
                self.embedder.model_name(),
                dimensions,
                self.store.dimension()
            )));
        }
        Ok(())
    }

    fn begin_run(&self) -> RunContext {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.cancel.lock() {
            *current = token.clone();
        }
        RunContext {
            token,
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    fn check(&self, ctx: &RunContext) -> Result<(), IndexError> {
        if ctx.token.is_cancelled() || self.generation.load(Ordering::SeqCst) != ctx.generation {
            return Err(IndexError::Cancelled);
        }
        Ok(())
    }

    fn set_state(&self, state: IndexState, message: &str) {
        debug!("Index state -> {}: {}", state, message);
        self.status.send_modify(|s| {
            s.state = state;
            s.message = message.to_string();
        });
    }

    fn set_error(&self, err: &IndexError) {
        error!("Indexing failed: {}", err);
        self.set_state(IndexState::Error, &err.to_string());
    }

    fn advance(&self, files: usize) {
        self.status.send_modify(|s| s.processed += files);
    }
}

#[async_trait]
impl BranchChangeListener for IndexOrchestrator {
    /// Abandon the current generation and re-index for the new branch.
    async fn on_branch_changed(&self, old: Option<&str>, new: Option<&str>) -> anyhow::Result<()> {
        info!(
            "Re-indexing after branch change {} -> {}",
            old.unwrap_or("(none)"),
            new.unwrap_or("(none)")
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_indexing();
        self.parse_cache.lock().await.clear();

        match self.start_indexing().await {
            Ok(_) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("re-index after branch change failed")),
        }
    }
}
