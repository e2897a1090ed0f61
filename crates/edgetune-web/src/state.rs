//! Diagnostics service state: rate limiter and report cache behind one lock.
//!
//! Every request holds the lock from the rate-limit check until the response
//! snapshot is chosen, so concurrent callers on an expired cache trigger a
//! single probe run. A run that outlives its timeout keeps running on the
//! blocking pool; no new run starts until it has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use edgetune_core::cache::ReportCache;
use edgetune_core::config::DiagnosticsConfig;
use edgetune_core::host::Clock;
use edgetune_core::probe::{Probe, ProbeError, ReportSnapshot};
use edgetune_core::ratelimit::{RateDecision, RateLimiter};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub(crate) enum PerfError {
    #[error("rate limited, retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },
    #[error("check failed: {0}")]
    CheckFailed(String),
    #[error("check timed out")]
    CheckTimeout,
    #[error("no report: {0}")]
    NoReport(String),
}

impl From<ProbeError> for PerfError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::Failed(why) => PerfError::CheckFailed(why),
            ProbeError::TimedOut(_) => PerfError::CheckTimeout,
            ProbeError::NoReport(why) => PerfError::NoReport(why),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Served {
    Hit(Arc<ReportSnapshot>),
    Miss(Arc<ReportSnapshot>),
}

impl Served {
    pub(crate) fn snapshot(&self) -> &ReportSnapshot {
        match self {
            Served::Hit(s) | Served::Miss(s) => s,
        }
    }

    pub(crate) fn cache_label(&self) -> &'static str {
        match self {
            Served::Hit(_) => "hit",
            Served::Miss(_) => "miss",
        }
    }
}

struct ServiceState {
    limiter: RateLimiter,
    cache: ReportCache,
    /// A probe run abandoned by a timed-out request.
    inflight: Option<JoinHandle<Result<ReportSnapshot, ProbeError>>>,
}

pub(crate) struct DiagnosticsService {
    state: Mutex<ServiceState>,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    probe_timeout: Duration,
    probe_runs: AtomicU64,
}

pub(crate) type SharedService = Arc<DiagnosticsService>;

impl DiagnosticsService {
    pub(crate) fn new(config: &DiagnosticsConfig, probe: Arc<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        let mut cache = ReportCache::new(config.cache_ttl);
        if let Some(path) = &config.cache_file {
            cache = cache.with_persistence(path);
        }
        Self {
            state: Mutex::new(ServiceState {
                limiter: RateLimiter::new(config.min_interval),
                cache,
                inflight: None,
            }),
            probe,
            clock,
            probe_timeout: config.probe_timeout,
            probe_runs: AtomicU64::new(0),
        }
    }

    /// Number of probe runs started since startup.
    pub(crate) fn probe_runs(&self) -> u64 {
        self.probe_runs.load(Ordering::Relaxed)
    }

    /// CHECK_RATE_LIMIT → CHECK_CACHE → RUN_PROBE → store, under one lock.
    pub(crate) async fn request(&self) -> Result<Served, PerfError> {
        let mut state = self.state.lock().await;

        let now = self.clock.now();
        if let RateDecision::Limited { retry_after } = state.limiter.check_and_update(now) {
            return Err(PerfError::RateLimited { retry_after });
        }
        if let Some(snapshot) = state.cache.fresh(now) {
            return Ok(Served::Hit(snapshot));
        }

        if state.inflight.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!("previous probe run still in progress");
            return Err(PerfError::CheckTimeout);
        }
        state.inflight = None;

        let run = self.probe_runs.fetch_add(1, Ordering::Relaxed) + 1;
        info!(run, "cache stale, running probe");
        let probe = Arc::clone(&self.probe);
        let mut task = tokio::task::spawn_blocking(move || probe.run());

        let snapshot = match tokio::time::timeout(self.probe_timeout, &mut task).await {
            Err(_) => {
                warn!(timeout_secs = self.probe_timeout.as_secs_f64(), "probe timed out");
                state.inflight = Some(task);
                return Err(PerfError::CheckTimeout);
            }
            Ok(Err(join)) => {
                warn!(error = %join, "probe task panicked");
                return Err(PerfError::CheckFailed(join.to_string()));
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "probe failed");
                return Err(e.into());
            }
            Ok(Ok(Ok(snapshot))) => snapshot,
        };

        let stored = state.cache.store(snapshot, self.clock.now());
        Ok(Served::Miss(stored))
    }

    #[cfg(test)]
    async fn cached(&self) -> Option<Arc<ReportSnapshot>> {
        let state = self.state.lock().await;
        state.cache.entry().map(|e| Arc::clone(&e.snapshot))
    }
}
