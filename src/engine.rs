//! Engine facade.
//!
//! Owns one instance of each component and runs passes:
//! sample → extract → reconcile → cache → notify. Passes are serialized by
//! an async mutex; canonical state is mutated only inside a pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::cache::{CacheEntry, ResultCache};
use crate::config::{Config, Timings};
use crate::detector::{ChangeDetector, ChangeSource, DetectorHandle, PollSource, SharedSignature};
use crate::entity::{Candidate, Entity, EntityKind};
use crate::error::{Error, Result};
use crate::extract::{Extractor, ExtractorRegistry};
use crate::notifier::{self, LegacyLookup, Notifier, Refresh};
use crate::reconcile::CanonicalState;
use crate::transcript::{ChangeSignature, TranscriptSource};

const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub active: bool,
    pub cache_size: usize,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub passes: u64,
    pub entities: usize,
    pub consumers: usize,
    pub evicted_by_age: u64,
    pub evicted_by_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signature: Option<ChangeSignature>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: String,
    pub at: DateTime<Utc>,
    pub messages: usize,
    pub signature: ChangeSignature,
    pub added: Vec<Entity>,
    pub changed: Vec<Entity>,
    /// Pattern keys whose extractor failed this pass.
    pub failed: Vec<String>,
    pub delivered: usize,
    pub refreshed: usize,
    pub consumer_failures: usize,
}

impl PassReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Default)]
struct PassStats {
    passes: u64,
    last_pass_at: Option<DateTime<Utc>>,
}

struct EngineInner {
    source: Arc<dyn TranscriptSource>,
    config: Config,
    timings: Timings,
    registry: RwLock<ExtractorRegistry>,
    state: Arc<RwLock<CanonicalState>>,
    cache: Mutex<ResultCache>,
    notifier: RwLock<Notifier>,
    pass_lock: tokio::sync::Mutex<()>,
    stats: Mutex<PassStats>,
    last_signature: SharedSignature,
    active: AtomicBool,
    reports: broadcast::Sender<Arc<PassReport>>,
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("source", &self.inner.source.describe())
            .field("active", &self.inner.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl Engine {
    /// Engine with the built-in matchers and fresh canonical state.
    pub fn new(source: Arc<dyn TranscriptSource>, config: Config) -> Result<Self> {
        let registry = ExtractorRegistry::with_builtin()?;
        Self::with_parts(source, config, registry, Arc::new(RwLock::new(CanonicalState::new())))
    }

    /// Engine over an injected registry and canonical state.
    pub fn with_parts(
        source: Arc<dyn TranscriptSource>,
        config: Config,
        registry: ExtractorRegistry,
        state: Arc<RwLock<CanonicalState>>,
    ) -> Result<Self> {
        let timings = config.timings()?;
        let cache = ResultCache::from_config(&config.cache, &timings);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(EngineInner {
                source,
                config,
                timings,
                registry: RwLock::new(registry),
                state,
                cache: Mutex::new(cache),
                notifier: RwLock::new(Notifier::new()),
                pass_lock: tokio::sync::Mutex::new(()),
                stats: Mutex::new(PassStats::default()),
                last_signature: Arc::new(Mutex::new(None)),
                active: AtomicBool::new(false),
                reports,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn register_extractor(&self, pattern_key: impl Into<String>, extractor: impl Extractor + 'static) {
        write(&self.inner.registry).register(pattern_key, extractor);
    }

    pub fn register_consumer<F>(&self, kind: EntityKind, handler: F)
    where
        F: Fn(&[Entity]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.notifier).register_consumer(kind, handler);
    }

    pub fn register_fallback(
        &self,
        capability: impl Into<String>,
        kinds: &[EntityKind],
        refresher: Arc<dyn Refresh>,
    ) {
        write(&self.inner.notifier).register_fallback(capability, kinds, refresher);
    }

    /// Run the legacy name-based discovery once over `lookup`.
    pub fn discover_legacy(&self, lookup: &dyn LegacyLookup) -> usize {
        let mut guard = write(&self.inner.notifier);
        notifier::discover_legacy(&mut guard, lookup, notifier::LEGACY_CONSUMERS)
    }

    /// Subscribe to pass reports, including no-op passes.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PassReport>> {
        self.inner.reports.subscribe()
    }

    /// Snapshot of canonical entities of one kind.
    pub fn canonical_state(&self, kind: EntityKind) -> Vec<Entity> {
        read(&self.inner.state).entities(kind)
    }

    /// Full canonical state snapshot.
    pub fn snapshot(&self) -> CanonicalState {
        read(&self.inner.state).clone()
    }

    pub fn points_balance(&self) -> i64 {
        read(&self.inner.state).points_balance()
    }

    pub fn cache_latest(&self, pattern_key: &str) -> Option<CacheEntry> {
        lock(&self.inner.cache).latest(pattern_key).cloned()
    }

    /// Sweep the result cache now; returns the number of entries removed.
    pub fn sweep_cache(&self) -> usize {
        lock(&self.inner.cache).sweep()
    }

    pub fn stats(&self) -> Stats {
        let cache = lock(&self.inner.cache).stats();
        let (passes, last_pass_at) = {
            let stats = lock(&self.inner.stats);
            (stats.passes, stats.last_pass_at)
        };
        Stats {
            active: self.inner.active.load(Ordering::SeqCst),
            cache_size: cache.entries,
            last_pass_at,
            passes,
            entities: read(&self.inner.state).len(),
            consumers: read(&self.inner.notifier).consumer_count(),
            evicted_by_age: cache.evicted_by_age,
            evicted_by_size: cache.evicted_by_size,
            last_signature: lock(&self.inner.last_signature).clone(),
        }
    }

    /// Run one full pass over the current transcript.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let _pass = self.inner.pass_lock.lock().await;
        let pass_id = Ulid::new().to_string();

        let source = Arc::clone(&self.inner.source);
        let transcript = tokio::task::spawn_blocking(move || source.snapshot())
            .await
            .map_err(|err| Error::SourceUnavailable(format!("snapshot task failed: {err}")))??;
        let signature = transcript.signature();

        let registry = read(&self.inner.registry).clone();
        let results = registry.run_all(&transcript).await;

        let candidates: Vec<Candidate> = results
            .iter()
            .flat_map(|result| result.candidates.iter().cloned())
            .collect();
        let failed: Vec<String> = results
            .iter()
            .filter(|result| result.failed)
            .map(|result| result.pattern_key.clone())
            .collect();

        let points_complete = results
            .iter()
            .any(|result| result.kind == EntityKind::PointsEvent)
            && !results
                .iter()
                .any(|result| result.kind == EntityKind::PointsEvent && result.failed);

        let delta = {
            let mut state = write(&self.inner.state);
            let delta = state.apply(&candidates);
            if points_complete {
                state.retain_live_points(
                    candidates
                        .iter()
                        .filter(|candidate| candidate.kind() == EntityKind::PointsEvent)
                        .map(|candidate| candidate.id.clone()),
                );
            }
            delta
        };

        {
            let mut cache = lock(&self.inner.cache);
            for result in results.into_iter().filter(|result| !result.failed) {
                cache.put(result.pattern_key, result.candidates);
            }
        }

        let (report, added, changed) = {
            let state = read(&self.inner.state);
            let notifier = read(&self.inner.notifier);
            let report = notifier.notify(&delta, &state);
            let added: Vec<Entity> = delta
                .added
                .iter()
                .filter_map(|key| state.get_key(key).cloned())
                .collect();
            let changed: Vec<Entity> = delta
                .changed
                .iter()
                .filter_map(|key| state.get_key(key).cloned())
                .collect();
            (report, added, changed)
        };

        let at = Utc::now();
        {
            let mut stats = lock(&self.inner.stats);
            stats.passes += 1;
            stats.last_pass_at = Some(at);
        }
        *lock(&self.inner.last_signature) = Some(signature.clone());

        tracing::debug!(
            pass_id = %pass_id,
            messages = transcript.len(),
            candidates = candidates.len(),
            added = added.len(),
            changed = changed.len(),
            failed = failed.len(),
            "pass complete"
        );

        let report = PassReport {
            pass_id,
            at,
            messages: transcript.len(),
            signature,
            added,
            changed,
            failed,
            delivered: report.delivered,
            refreshed: report.refreshed,
            consumer_failures: report.failures.len(),
        };
        let _ = self.inner.reports.send(Arc::new(report.clone()));
        Ok(report)
    }

    /// Start change detection and the periodic cache sweep.
    ///
    /// `push` is attached with bounded retry; when it cannot attach the
    /// engine runs on polling alone.
    pub async fn start(&self, push: Option<Box<dyn ChangeSource>>) -> Result<EngineHandle> {
        let timings = &self.inner.timings;
        let mut detector = ChangeDetector::from_timings(Arc::clone(&self.inner.source), timings)
            .with_retry(self.inner.config.source.retry_attempts, timings.retry_backoff)
            .with_signature(Arc::clone(&self.inner.last_signature));

        let engine = self.clone();
        detector.on_change(move || {
            let engine = engine.clone();
            async move {
                match engine.run_pass().await {
                    Ok(report) => Some(report.signature),
                    Err(err) => {
                        tracing::warn!(error = %err, "pass skipped");
                        None
                    }
                }
            }
        });

        let push_requested = push.is_some();
        if let Some(push) = push {
            detector.add_source(push);
        }
        detector.add_source(Box::new(PollSource::new(
            Arc::clone(&self.inner.source),
            timings.poll_interval,
        )));

        let detector = detector.start().await?;
        let push_attached = push_requested && detector.attached().len() > 1;
        if push_requested && !push_attached {
            tracing::warn!("push source unavailable; running poll-only");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(self.clone(), timings.sweep_interval, stop_rx);

        self.inner.active.store(true, Ordering::SeqCst);
        tracing::info!(
            source = %self.inner.source.describe(),
            push = push_attached,
            "engine started"
        );

        Ok(EngineHandle {
            engine: self.clone(),
            detector: Some(detector),
            sweeper: Some(sweeper),
            stop: stop_tx,
            push_attached,
        })
    }
}

fn spawn_sweeper(engine: Engine, period: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // first tick is immediate
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let removed = engine.sweep_cache();
                    if removed > 0 {
                        tracing::debug!(removed, "cache swept");
                    }
                }
            }
        }
    })
}

/// Running engine; dropping it stops detection.
pub struct EngineHandle {
    engine: Engine,
    detector: Option<DetectorHandle>,
    sweeper: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
    push_attached: bool,
}

impl EngineHandle {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Whether the push source attached; false means poll-only.
    pub fn push_attached(&self) -> bool {
        self.push_attached
    }

    /// Stop detection and the sweeper. A pass already running finishes.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        if let Some(detector) = self.detector.take() {
            detector.shutdown().await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        self.engine.inner.active.store(false, Ordering::SeqCst);
        tracing::info!("engine stopped");
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.engine.inner.active.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
