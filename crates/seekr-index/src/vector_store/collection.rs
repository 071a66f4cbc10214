//! Ensure-once collection setup.
//!
//! Many files are indexed concurrently at startup and each path through the
//! pipeline may need the collection. A successful ensure is remembered per
//! `(name, dimension)` for the life of the manager, and callers arriving
//! while one is in flight await that same request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::VectorStoreError;

type EnsureFuture = Shared<BoxFuture<'static, Result<bool, VectorStoreError>>>;

enum Slot {
    Pending(EnsureFuture),
    Ready,
}

/// Memoizes and deduplicates collection setup.
#[derive(Default)]
pub struct CollectionManager {
    slots: Mutex<HashMap<(String, usize), Slot>>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `ensure` at most once per `(name, dimension)`.
    ///
    /// Returns the outcome of the request this call joined: `Ok(true)` when it
    /// created the collection. Once an ensure has succeeded, later calls
    /// return `Ok(false)` without running anything. A failed ensure is
    /// forgotten so the next caller retries.
    pub async fn ensure_once<F, Fut>(
        &self,
        name: &str,
        dimension: usize,
        ensure: F,
    ) -> Result<bool, VectorStoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, VectorStoreError>> + Send + 'static,
    {
        let key = (name.to_string(), dimension);

        let pending = {
            let mut slots = self.lock();
            match slots.get(&key) {
                Some(Slot::Ready) => return Ok(false),
                Some(Slot::Pending(fut)) => {
                    debug!("Joining in-flight ensure for {} ({})", name, dimension);
                    fut.clone()
                }
                None => {
                    let fut = ensure().boxed().shared();
                    slots.insert(key.clone(), Slot::Pending(fut.clone()));
                    fut
                }
            }
        };

        let outcome = pending.clone().await;

        let mut slots = self.lock();
        let still_ours = matches!(slots.get(&key), Some(Slot::Pending(f)) if f.ptr_eq(&pending));
        if still_ours {
            if outcome.is_ok() {
                slots.insert(key, Slot::Ready);
            } else {
                slots.remove(&key);
            }
        }
        outcome
    }

    /// Whether an ensure for `(name, dimension)` has already succeeded.
    pub fn is_ready(&self, name: &str, dimension: usize) -> bool {
        matches!(
            self.lock().get(&(name.to_string(), dimension)),
            Some(Slot::Ready)
        )
    }

    /// Forget every outcome for `name`, e.g. after the collection was deleted.
    pub fn invalidate(&self, name: &str) {
        self.lock().retain(|(n, _), _| n != name);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, usize), Slot>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_ensure(
        calls: Arc<AtomicUsize>,
        result: Result<bool, VectorStoreError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<bool, VectorStoreError>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_request() {
        let manager = Arc::new(CollectionManager::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .ensure_once("ws-abc", 768, counting_ensure(calls, Ok(true)))
                    .await
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert!(manager.is_ready("ws-abc", 768));
    }

    #[tokio::test]
    async fn test_success_is_memoized() {
        let manager = CollectionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(true)))
            .await;
        let second = manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(true)))
            .await;

        assert_eq!(first, Ok(true));
        assert_eq!(second, Ok(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_retried_by_next_caller() {
        let manager = CollectionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failed = manager
            .ensure_once(
                "c",
                3,
                counting_ensure(calls.clone(), Err(VectorStoreError::Connection("down".into()))),
            )
            .await;
        assert!(failed.is_err());
        assert!(!manager.is_ready("c", 3));

        let retried = manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(false)))
            .await;
        assert_eq!(retried, Ok(false));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dimension_is_part_of_the_key() {
        let manager = CollectionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(true)))
            .await
            .unwrap();
        manager
            .ensure_once("c", 4, counting_ensure(calls.clone(), Ok(true)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forgets_outcome() {
        let manager = CollectionManager::new();
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(true)))
            .await
            .unwrap();
        manager.invalidate("c");
        assert!(!manager.is_ready("c", 3));

        manager
            .ensure_once("c", 3, counting_ensure(calls.clone(), Ok(true)))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
