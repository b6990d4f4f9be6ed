//! Revision cache keyed by repository location.

use crate::populator::CachePopulator;
use chrono::{DateTime, Utc};
use keel_core::ports::FileInfo;
use keel_core::revision::Revision;
use keel_core::{Error, Result};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

const DEFAULT_CAPACITY: usize = 64;

/// Snapshot of a repository at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    location: String,
    revision: Option<Revision>,
    files: BTreeMap<String, FileInfo>,
    populated_at: Option<DateTime<Utc>>,
}

impl CacheItem {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            revision: None,
            files: BTreeMap::new(),
            populated_at: None,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Revision of the last successful population.
    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    pub fn file(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn populated_at(&self) -> Option<DateTime<Utc>> {
        self.populated_at
    }

    /// Replace the whole payload.
    pub fn update(&mut self, revision: Revision, files: Vec<FileInfo>) {
        self.files = files.into_iter().map(|f| (f.path.clone(), f)).collect();
        self.revision = Some(revision);
        self.populated_at = Some(Utc::now());
    }
}

struct Slot {
    /// Held for the whole of a population, serialising work per location.
    item: tokio::sync::Mutex<CacheItem>,
    /// Published copy of `item.revision` for lock-free probes.
    revision: RwLock<Option<Revision>>,
}

impl Slot {
    fn new(location: &str) -> Self {
        Self {
            item: tokio::sync::Mutex::new(CacheItem::new(location)),
            revision: RwLock::new(None),
        }
    }

    fn revision(&self) -> Option<Revision> {
        self.revision
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    populations: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub populations: u64,
    pub failures: u64,
}

/// Cache of repository snapshots.
///
/// At most one population runs per location; concurrent callers for the
/// same location wait for it and then reuse its result. Population is
/// all-or-nothing: a failed refresh leaves the previous snapshot in place.
/// Locations beyond the capacity are evicted least-recently-used first.
pub struct ScmRevisionCache {
    slots: Mutex<LruCache<String, Arc<Slot>>>,
    /// Every slot still referenced somewhere, evicted or not. A location
    /// being populated keeps its slot here, so later callers queue behind
    /// the running population instead of starting another.
    live: Mutex<HashMap<String, Weak<Slot>>>,
    counters: Counters,
}

impl Default for ScmRevisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ScmRevisionCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Mutex::new(LruCache::new(capacity)),
            live: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    fn slot(&self, location: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(location) {
            return Arc::clone(slot);
        }
        let slot = {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            live.retain(|_, slot| slot.strong_count() > 0);
            match live.get(location).and_then(Weak::upgrade) {
                Some(slot) => {
                    debug!(location = %location, "Reattached SCM cache entry");
                    slot
                }
                None => {
                    let slot = Arc::new(Slot::new(location));
                    live.insert(location.to_string(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        if let Some((evicted, _)) = slots.push(location.to_string(), Arc::clone(&slot)) {
            debug!(location = %evicted, "Evicted SCM cache entry");
        }
        slot
    }

    /// Snapshot of the populator's repository at `revision`, populating it
    /// first if needed.
    pub async fn get(
        &self,
        populator: &dyn CachePopulator,
        revision: &Revision,
    ) -> Result<CacheItem> {
        let location = populator.unique_location();
        let slot = self.slot(&location);
        let mut item = slot.item.lock().await;

        if !populator.requires_refresh(&item, revision) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(item.clone());
        }

        let mut scratch = item.clone();
        self.counters.populations.fetch_add(1, Ordering::Relaxed);
        match populator.populate(&mut scratch, revision).await {
            Ok(()) => {
                info!(
                    location = %location,
                    %revision,
                    files = scratch.file_count(),
                    "Populated SCM cache"
                );
                *item = scratch;
                *slot.revision.write().unwrap_or_else(PoisonError::into_inner) =
                    item.revision().cloned();
                Ok(item.clone())
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(location = %location, %revision, error = %err, "SCM cache population failed");
                Err(Error::Scm(err))
            }
        }
    }

    /// True unless `location` is cached at exactly `revision`. Does not
    /// touch recency and never blocks on a population.
    pub fn requires_refresh(&self, location: &str, revision: &Revision) -> bool {
        self.cached_revision(location).as_ref() != Some(revision)
    }

    /// Revision of the last successful population of `location`.
    pub fn cached_revision(&self, location: &str) -> Option<Revision> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.peek(location).and_then(|slot| slot.revision())
    }

    /// Drop the entry for `location`. A population already in flight still
    /// completes, and callers arriving meanwhile wait for it.
    pub fn invalidate(&self, location: &str) -> bool {
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(location)
            .is_some();
        if removed {
            debug!(location = %location, "Invalidated SCM cache entry");
        }
        removed
    }

    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            populations: self.counters.populations.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_core::ScmError;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Knows a fixed set of revisions and counts remote queries.
    struct CountingPopulator {
        location: String,
        known: HashSet<String>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingPopulator {
        fn new(location: &str, known: &[&str]) -> Self {
            Self {
                location: location.to_string(),
                known: known.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CachePopulator for CountingPopulator {
        fn unique_location(&self) -> String {
            self.location.clone()
        }

        async fn populate(
            &self,
            item: &mut CacheItem,
            revision: &Revision,
        ) -> std::result::Result<(), ScmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if !self.known.contains(revision.as_str()) {
                return Err(ScmError::UnknownRevision {
                    location: self.location.clone(),
                    revision: revision.to_string(),
                });
            }
            item.update(
                revision.clone(),
                vec![FileInfo {
                    path: format!("src/{}.rs", revision),
                    revision: Some(revision.clone()),
                    directory: false,
                }],
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_populate_clears_requires_refresh() {
        let cache = ScmRevisionCache::new(4);
        let populator = CountingPopulator::new("git:repo", &["r1"]);
        let r1 = Revision::new("r1");

        assert!(cache.requires_refresh("git:repo", &r1));
        let item = cache.get(&populator, &r1).await.unwrap();
        assert!(!cache.requires_refresh("git:repo", &r1));
        assert_eq!(item.revision(), Some(&r1));
        assert!(item.file("src/r1.rs").is_some());

        cache.get(&populator, &r1).await.unwrap();
        assert_eq!(populator.calls(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_population_keeps_previous_snapshot() {
        let cache = ScmRevisionCache::new(4);
        let populator = CountingPopulator::new("git:repo", &["r1"]);
        let r1 = Revision::new("r1");
        cache.get(&populator, &r1).await.unwrap();

        let err = cache.get(&populator, &Revision::new("r2")).await.unwrap_err();
        assert!(matches!(err, Error::Scm(ScmError::UnknownRevision { .. })));

        assert_eq!(cache.cached_revision("git:repo"), Some(r1.clone()));
        let item = cache.get(&populator, &r1).await.unwrap();
        assert!(item.file("src/r1.rs").is_some());
        assert_eq!(populator.calls(), 2);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_population() {
        let cache = Arc::new(ScmRevisionCache::new(4));
        let mut populator = CountingPopulator::new("git:repo", &["r1"]);
        populator.delay = Duration::from_millis(50);
        let populator = Arc::new(populator);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let cache = Arc::clone(&cache);
            let populator = Arc::clone(&populator);
            handles.push(tokio::spawn(async move {
                cache.get(populator.as_ref(), &Revision::new("r1")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(populator.calls(), 1);
    }

    #[tokio::test]
    async fn test_least_recently_used_location_evicted() {
        let cache = ScmRevisionCache::new(2);
        let a = CountingPopulator::new("a", &["r1"]);
        let b = CountingPopulator::new("b", &["r1"]);
        let c = CountingPopulator::new("c", &["r1"]);
        let r1 = Revision::new("r1");

        cache.get(&a, &r1).await.unwrap();
        cache.get(&b, &r1).await.unwrap();
        cache.get(&a, &r1).await.unwrap();
        cache.get(&c, &r1).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.cached_revision("a").is_some());
        assert!(cache.cached_revision("b").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_population() {
        let cache = ScmRevisionCache::new(2);
        let populator = CountingPopulator::new("git:repo", &["r1"]);
        let r1 = Revision::new("r1");

        cache.get(&populator, &r1).await.unwrap();
        assert!(cache.invalidate("git:repo"));
        assert!(cache.requires_refresh("git:repo", &r1));

        cache.get(&populator, &r1).await.unwrap();
        assert_eq!(populator.calls(), 2);
    }

    #[tokio::test]
    async fn test_evicted_location_keeps_single_population() {
        let cache = Arc::new(ScmRevisionCache::new(1));
        let mut a = CountingPopulator::new("a", &["r1"]);
        a.delay = Duration::from_millis(200);
        let a = Arc::new(a);
        let b = CountingPopulator::new("b", &["r1"]);

        let spawn_get = || {
            let cache = Arc::clone(&cache);
            let a = Arc::clone(&a);
            tokio::spawn(async move { cache.get(a.as_ref(), &Revision::new("r1")).await })
        };

        let first = spawn_get();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Pushes "a" out while its population is still running.
        cache.get(&b, &Revision::new("r1")).await.unwrap();
        assert!(cache.cached_revision("a").is_none());

        let second = spawn_get();
        first.await.unwrap().unwrap();
        let item = second.await.unwrap().unwrap();

        assert_eq!(item.revision(), Some(&Revision::new("r1")));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_during_population_keeps_single_population() {
        let cache = Arc::new(ScmRevisionCache::new(4));
        let mut populator = CountingPopulator::new("git:repo", &["r1"]);
        populator.delay = Duration::from_millis(200);
        let populator = Arc::new(populator);

        let first = {
            let cache = Arc::clone(&cache);
            let populator = Arc::clone(&populator);
            tokio::spawn(async move { cache.get(populator.as_ref(), &Revision::new("r1")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.invalidate("git:repo"));

        let item = cache
            .get(populator.as_ref(), &Revision::new("r1"))
            .await
            .unwrap();
        first.await.unwrap().unwrap();

        assert!(item.file("src/r1.rs").is_some());
        assert_eq!(populator.calls(), 1);
        assert_eq!(cache.cached_revision("git:repo"), Some(Revision::new("r1")));
    }
}
