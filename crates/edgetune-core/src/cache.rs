//! Single-slot, TTL-bounded cache of the last report snapshot.
//!
//! Not synchronized: the owner holds it under the diagnostics service lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::probe::ReportSnapshot;
use crate::util::write_atomic;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub snapshot: Arc<ReportSnapshot>,
    pub produced_at: Instant,
}

#[derive(Debug)]
pub struct ReportCache {
    ttl: Duration,
    entry: Option<CacheEntry>,
    persist_to: Option<PathBuf>,
}

impl ReportCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: None,
            persist_to: None,
        }
    }

    /// Also writes every stored snapshot to `path` as JSON.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_to = Some(path.into());
        self
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    /// The cached snapshot if its age at `now` is below the TTL.
    pub fn fresh(&self, now: Instant) -> Option<Arc<ReportSnapshot>> {
        let entry = self.entry.as_ref()?;
        let age = now.saturating_duration_since(entry.produced_at);
        if age < self.ttl {
            Some(Arc::clone(&entry.snapshot))
        } else {
            debug!(age_secs = age.as_secs_f64(), "cached report expired");
            None
        }
    }

    /// Replaces the entry. Persistence failures are logged, never returned.
    pub fn store(&mut self, snapshot: ReportSnapshot, now: Instant) -> Arc<ReportSnapshot> {
        let snapshot = Arc::new(snapshot);
        if let Some(path) = &self.persist_to {
            persist(path, &snapshot);
        }
        self.entry = Some(CacheEntry {
            snapshot: Arc::clone(&snapshot),
            produced_at: now,
        });
        snapshot
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

fn persist(path: &Path, snapshot: &ReportSnapshot) {
    let result = serde_json::to_vec_pretty(snapshot)
        .map_err(std::io::Error::other)
        .and_then(|json| write_atomic(path, &json));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to persist report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Layout, MockFs, MockRunner};
    use crate::probe::{Probe, SystemProbe};

    fn snapshot() -> ReportSnapshot {
        SystemProbe::new(MockFs::raspberry_pi(), MockRunner::new(), Layout::default())
            .run()
            .unwrap()
    }

    #[test]
    fn test_fresh_within_ttl() {
        let t0 = Instant::now();
        let mut cache = ReportCache::new(Duration::from_secs(300));
        assert!(cache.fresh(t0).is_none());

        let stored = cache.store(snapshot(), t0);
        let hit = cache.fresh(t0 + Duration::from_secs(100)).unwrap();
        assert!(Arc::ptr_eq(&stored, &hit));
        assert!(cache.fresh(t0 + Duration::from_secs(301)).is_none());
        // The expired entry is kept until replaced
        assert!(cache.entry().is_some());
    }

    #[test]
    fn test_invalidate() {
        let t0 = Instant::now();
        let mut cache = ReportCache::new(Duration::from_secs(300));
        cache.store(snapshot(), t0);
        cache.invalidate();
        assert!(cache.fresh(t0).is_none());
    }

    #[test]
    fn test_persists_each_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf-report.json");
        let mut cache = ReportCache::new(Duration::from_secs(300)).with_persistence(&path);
        let snap = snapshot();
        cache.store(snap.clone(), Instant::now());

        let on_disk: ReportSnapshot =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, snap);
    }

    #[test]
    fn test_persist_failure_still_caches() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let mut cache =
            ReportCache::new(Duration::from_secs(300)).with_persistence(blocker.join("report.json"));
        let now = Instant::now();
        cache.store(snapshot(), now);
        assert!(cache.fresh(now).is_some());
    }
}
