//! Change detection.
//!
//! Two kinds of [`ChangeSource`] feed one debounce gate:
//!
//! - push: [`StructuralNotifier`] handles (and [`FileWatchSource`], which
//!   drives one from file-system events) report [`Mutation`]s, filtered
//!   through deny-then-allow glob lists;
//! - poll: [`PollSource`] compares the transcript's [`ChangeSignature`] to
//!   the last one any pass observed.
//!
//! The gate fires the `on_change` callback once per quiet window. While a
//! pass is in flight, further bursts only set a pending flag; when the pass
//! completes the signature is re-evaluated and at most one more pass runs.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use glob::Pattern;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{DetectorConfig, Timings};
use crate::error::{Error, Result};
use crate::transcript::{ChangeSignature, TranscriptSource};

/// Future returned by a pass callback; resolves to the signature the pass
/// saw, or `None` when it could not sample the transcript.
pub type PassFuture = Pin<Box<dyn Future<Output = Option<ChangeSignature>> + Send>>;

pub type ChangeCallback = Arc<dyn Fn() -> PassFuture + Send + Sync>;

/// Signature of the transcript as last observed by any path.
pub type SharedSignature = Arc<Mutex<Option<ChangeSignature>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub target: String,
}

impl Mutation {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firing {
    Structural { target: String },
    Poll,
}

/// Deny-then-allow selector filter for mutation targets.
#[derive(Debug, Clone, Default)]
pub struct MutationFilter {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl MutationFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p)
                        .map_err(|e| Error::InvalidConfig(format!("invalid pattern '{p}': {e}")))
                })
                .collect()
        };
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        Self::new(&config.allow, &config.deny)
    }

    pub fn accepts(&self, target: &str) -> bool {
        if self.deny.iter().any(|p| p.matches(target)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|p| p.matches(target))
    }
}

/// Everything a source needs to report firings.
#[derive(Clone)]
pub struct SourceContext {
    pub firings: mpsc::UnboundedSender<Firing>,
    pub last_signature: SharedSignature,
    pub shutdown: watch::Receiver<bool>,
}

/// A producer of change firings.
pub trait ChangeSource: Send {
    fn describe(&self) -> String;

    /// Attach and start producing into `ctx`. Errors mean the source could
    /// not attach; the caller may retry.
    fn spawn(&mut self, ctx: SourceContext) -> Result<JoinHandle<()>>;
}

// =============================================================================
// Push path
// =============================================================================

/// Host-facing handle for reporting structural mutations.
#[derive(Clone)]
pub struct StructuralNotifier {
    filter: Arc<MutationFilter>,
    tx: mpsc::UnboundedSender<Mutation>,
}

impl StructuralNotifier {
    /// Create a notifier handle and the push source it feeds.
    pub fn channel(filter: MutationFilter) -> (Self, PushSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                filter: Arc::new(filter),
                tx,
            },
            PushSource { rx: Some(rx) },
        )
    }

    /// Report a mutation. Returns whether it passed the filter and was
    /// delivered.
    pub fn notify(&self, mutation: Mutation) -> bool {
        if !self.filter.accepts(&mutation.target) {
            tracing::trace!(target_selector = %mutation.target, "mutation filtered");
            return false;
        }
        self.tx.send(mutation).is_ok()
    }
}

pub struct PushSource {
    rx: Option<mpsc::UnboundedReceiver<Mutation>>,
}

impl ChangeSource for PushSource {
    fn describe(&self) -> String {
        "push".to_string()
    }

    fn spawn(&mut self, ctx: SourceContext) -> Result<JoinHandle<()>> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| Error::SourceUnavailable("push source already attached".to_string()))?;
        let SourceContext {
            firings,
            mut shutdown,
            ..
        } = ctx;
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    mutation = rx.recv() => match mutation {
                        Some(mutation) => {
                            if firings.send(Firing::Structural { target: mutation.target }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }))
    }
}

/// Push source backed by file-system events for a transcript file.
pub struct FileWatchSource {
    path: PathBuf,
    filter: MutationFilter,
}

impl FileWatchSource {
    pub fn new(path: impl Into<PathBuf>, filter: MutationFilter) -> Self {
        Self {
            path: path.into(),
            filter,
        }
    }

    fn watch_dir(&self) -> Result<PathBuf> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.is_dir() {
            return Err(Error::SourceUnavailable(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        Ok(dir)
    }
}

fn same_file(event_path: &Path, watched: &Path) -> bool {
    event_path == watched || event_path.file_name() == watched.file_name()
}

impl ChangeSource for FileWatchSource {
    fn describe(&self) -> String {
        format!("file-watch {}", self.path.display())
    }

    fn spawn(&mut self, ctx: SourceContext) -> Result<JoinHandle<()>> {
        // The parent directory is watched so that replace-by-rename writes
        // are still seen.
        let dir = self.watch_dir()?;
        let (notifier, mut push) = StructuralNotifier::channel(self.filter.clone());
        let target = self.path.clone();
        let target_label = self.path.display().to_string();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if event.kind.is_access() {
                        return;
                    }
                    if event.paths.iter().any(|p| same_file(p, &target)) {
                        notifier.notify(Mutation::new(target_label.clone()));
                    }
                }
                Err(err) => tracing::warn!(error = %err, "file watch error"),
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let mut shutdown = ctx.shutdown.clone();
        let forward = push.spawn(ctx)?;
        Ok(tokio::spawn(async move {
            // The watcher stops when dropped.
            let _watcher = watcher;
            let _ = shutdown.changed().await;
            let _ = forward.await;
        }))
    }
}

// =============================================================================
// Poll path
// =============================================================================

pub struct PollSource {
    source: Arc<dyn TranscriptSource>,
    interval: Duration,
}

impl PollSource {
    pub fn new(source: Arc<dyn TranscriptSource>, interval: Duration) -> Self {
        Self { source, interval }
    }
}

impl ChangeSource for PollSource {
    fn describe(&self) -> String {
        format!("poll every {:?}", self.interval)
    }

    fn spawn(&mut self, ctx: SourceContext) -> Result<JoinHandle<()>> {
        let source = Arc::clone(&self.source);
        let period = self.interval;
        let SourceContext {
            firings,
            last_signature,
            mut shutdown,
        } = ctx;

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let current = match current_signature(&source).await {
                            Some(current) => current,
                            None => continue,
                        };
                        let last = last_signature.lock().ok().and_then(|guard| guard.clone());
                        if last.as_ref() != Some(&current) {
                            tracing::debug!(messages = current.message_count, "poll detected change");
                            if firings.send(Firing::Poll).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }))
    }
}

async fn current_signature(source: &Arc<dyn TranscriptSource>) -> Option<ChangeSignature> {
    let source = Arc::clone(source);
    match tokio::task::spawn_blocking(move || source.signature()).await {
        Ok(Ok(signature)) => Some(signature),
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "signature unavailable");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "signature task failed");
            None
        }
    }
}

// =============================================================================
// Gate
// =============================================================================

pub struct ChangeDetector {
    source: Arc<dyn TranscriptSource>,
    debounce: Duration,
    sources: Vec<Box<dyn ChangeSource>>,
    callback: Option<ChangeCallback>,
    last_signature: SharedSignature,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn TranscriptSource>, debounce: Duration) -> Self {
        Self {
            source,
            debounce,
            sources: Vec::new(),
            callback: None,
            last_signature: Arc::new(Mutex::new(None)),
            retry_attempts: 0,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn from_timings(source: Arc<dyn TranscriptSource>, timings: &Timings) -> Self {
        Self::new(source, timings.debounce).with_retry(0, timings.retry_backoff)
    }

    /// Retry transient attach failures `attempts` times, doubling `backoff`
    /// after each one.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Share the last-observed signature with another component.
    pub fn with_signature(mut self, last_signature: SharedSignature) -> Self {
        self.last_signature = last_signature;
        self
    }

    pub fn last_signature(&self) -> SharedSignature {
        Arc::clone(&self.last_signature)
    }

    pub fn add_source(&mut self, source: Box<dyn ChangeSource>) {
        self.sources.push(source);
    }

    /// Register the pass callback run once per coalesced burst.
    pub fn on_change<F, Fut>(&mut self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ChangeSignature>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move || Box::pin(callback()) as PassFuture));
    }

    /// Attach every source and start the gate.
    ///
    /// A source that still fails after its retries is logged and skipped;
    /// the detector keeps running on the rest.
    pub async fn start(self) -> Result<DetectorHandle> {
        let callback = self
            .callback
            .ok_or_else(|| Error::InvalidArgument("no change callback registered".to_string()))?;

        let (firing_tx, firing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = SourceContext {
            firings: firing_tx.clone(),
            last_signature: Arc::clone(&self.last_signature),
            shutdown: shutdown_rx.clone(),
        };

        let mut tasks = Vec::new();
        let mut attached = Vec::new();
        for mut source in self.sources {
            match attach(source.as_mut(), &ctx, self.retry_attempts, self.retry_backoff).await {
                Ok(task) => {
                    tracing::info!(source = %source.describe(), "change source attached");
                    attached.push(source.describe());
                    tasks.push(task);
                }
                Err(err) => {
                    tracing::warn!(source = %source.describe(), error = %err, "change source failed to attach");
                }
            }
        }

        let gate = Gate {
            source: self.source,
            debounce: self.debounce,
            callback,
            last_signature: self.last_signature,
        };
        let gate_task = tokio::spawn(gate.run(firing_rx, shutdown_rx));

        Ok(DetectorHandle {
            shutdown: shutdown_tx,
            firings: firing_tx,
            gate: Some(gate_task),
            sources: tasks,
            attached,
        })
    }
}

async fn attach(
    source: &mut dyn ChangeSource,
    ctx: &SourceContext,
    attempts: u32,
    backoff: Duration,
) -> Result<JoinHandle<()>> {
    let mut delay = backoff;
    let mut attempt = 0;
    loop {
        match source.spawn(ctx.clone()) {
            Ok(task) => return Ok(task),
            Err(err) if err.is_transient() && attempt < attempts => {
                attempt += 1;
                tracing::debug!(
                    source = %source.describe(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying change source"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

struct Gate {
    source: Arc<dyn TranscriptSource>,
    debounce: Duration,
    callback: ChangeCallback,
    last_signature: SharedSignature,
}

impl Gate {
    async fn run(
        self,
        mut firings: mpsc::UnboundedReceiver<Firing>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Option<ChangeSignature>>();
        let mut deadline: Option<Instant> = None;
        let mut in_flight = false;
        let mut pending = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                firing = firings.recv() => match firing {
                    Some(firing) => {
                        tracing::trace!(?firing, "change firing");
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    None => break,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    deadline = None;
                    if in_flight {
                        pending = true;
                    } else {
                        in_flight = true;
                        self.launch(&done_tx);
                    }
                }
                seen = done_rx.recv(), if in_flight => {
                    in_flight = false;
                    let seen = seen.flatten();
                    if let Some(signature) = &seen {
                        if let Ok(mut last) = self.last_signature.lock() {
                            *last = Some(signature.clone());
                        }
                    }
                    if pending {
                        pending = false;
                        let current = current_signature(&self.source).await;
                        if current.is_none() || current != seen {
                            in_flight = true;
                            self.launch(&done_tx);
                        } else {
                            tracing::debug!("pending burst left transcript unchanged");
                        }
                    }
                }
            }
        }

        if in_flight {
            // Let the running pass finish.
            if let Some(Some(signature)) = done_rx.recv().await {
                if let Ok(mut last) = self.last_signature.lock() {
                    *last = Some(signature);
                }
            }
        }
        tracing::info!("change detector stopped");
    }

    fn launch(&self, done: &mpsc::UnboundedSender<Option<ChangeSignature>>) {
        let callback = Arc::clone(&self.callback);
        let done = done.clone();
        tokio::spawn(async move {
            // A pass that dies must still report back, or the gate stays in flight.
            let seen = match tokio::spawn(callback()).await {
                Ok(seen) => seen,
                Err(err) => {
                    tracing::warn!(error = %err, "pass task failed");
                    None
                }
            };
            let _ = done.send(seen);
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct DetectorHandle {
    shutdown: watch::Sender<bool>,
    firings: mpsc::UnboundedSender<Firing>,
    gate: Option<JoinHandle<()>>,
    sources: Vec<JoinHandle<()>>,
    attached: Vec<String>,
}

impl DetectorHandle {
    /// Descriptions of the sources that attached.
    pub fn attached(&self) -> &[String] {
        &self.attached
    }

    /// Inject a firing directly, as if a source reported it.
    pub fn fire(&self, firing: Firing) {
        let _ = self.firings.send(firing);
    }

    /// Stop all sources and wait for the gate, letting an in-flight pass
    /// finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.sources.drain(..) {
            let _ = task.await;
        }
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{MemoryTranscript, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_detector(
        transcript: &MemoryTranscript,
        pass_time: Duration,
    ) -> (ChangeDetector, Arc<AtomicUsize>) {
        let source: Arc<dyn TranscriptSource> = Arc::new(transcript.clone());
        let mut detector = ChangeDetector::new(Arc::clone(&source), Duration::from_millis(300));
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&passes);
        detector.on_change(move || {
            let counter = Arc::clone(&counter);
            let source = Arc::clone(&source);
            async move {
                let seen = source.signature().ok();
                tokio::time::sleep(pass_time).await;
                counter.fetch_add(1, Ordering::SeqCst);
                seen
            }
        });
        (detector, passes)
    }

    #[test]
    fn filter_denies_before_allowing() {
        let filter = MutationFilter::new(
            &["#chat/*".to_string()],
            &["#chat/typing*".to_string()],
        )
        .expect("filter");
        assert!(filter.accepts("#chat/message"));
        assert!(!filter.accepts("#chat/typing-indicator"));
        assert!(!filter.accepts("#sidebar"));

        let open = MutationFilter::new(&[], &["*.tmp".to_string()]).expect("filter");
        assert!(open.accepts("anything"));
        assert!(!open.accepts("x.tmp"));
    }

    #[test]
    fn invalid_filter_pattern_rejected() {
        assert!(matches!(
            MutationFilter::new(&["[".to_string()], &[]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_firings_runs_one_pass() {
        let transcript = MemoryTranscript::new();
        transcript.push(Role::Other, "[查看任务|1|Sweep]");
        let (mut detector, passes) = counting_detector(&transcript, Duration::from_millis(10));
        let (notifier, push) = StructuralNotifier::channel(MutationFilter::default());
        detector.add_source(Box::new(push));
        let handle = detector.start().await.expect("start");

        for _ in 0..10 {
            assert!(notifier.notify(Mutation::new("#chat")));
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_pass_does_not_wedge_the_gate() {
        let transcript = MemoryTranscript::new();
        let source: Arc<dyn TranscriptSource> = Arc::new(transcript.clone());
        let mut detector = ChangeDetector::new(source, Duration::from_millis(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        detector.on_change(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("consumer blew up mid-pass");
                }
                None
            }
        });
        let (notifier, push) = StructuralNotifier::channel(MutationFilter::default());
        detector.add_source(Box::new(push));
        let handle = detector.start().await.expect("start");

        notifier.notify(Mutation::new("#chat"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            notifier.notify(Mutation::new("#chat"));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_mutations_never_fire() {
        let transcript = MemoryTranscript::new();
        let (mut detector, passes) = counting_detector(&transcript, Duration::from_millis(10));
        let filter = MutationFilter::new(&[], &["#typing".to_string()]).expect("filter");
        let (notifier, push) = StructuralNotifier::channel(filter);
        detector.add_source(Box::new(push));
        let handle = detector.start().await.expect("start");

        assert!(!notifier.notify(Mutation::new("#typing")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_during_pass_runs_one_more_pass() {
        let transcript = MemoryTranscript::new();
        transcript.push(Role::Other, "first");
        let (mut detector, passes) = counting_detector(&transcript, Duration::from_secs(1));
        let (notifier, push) = StructuralNotifier::channel(MutationFilter::default());
        detector.add_source(Box::new(push));
        let handle = detector.start().await.expect("start");

        notifier.notify(Mutation::new("#chat"));
        // window expires at 300ms; the pass runs until 1300ms
        tokio::time::sleep(Duration::from_millis(400)).await;
        transcript.push(Role::Other, "second");
        for _ in 0..5 {
            notifier.notify(Mutation::new("#chat"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_burst_without_change_is_dropped() {
        let transcript = MemoryTranscript::new();
        transcript.push(Role::Other, "only");
        let (mut detector, passes) = counting_detector(&transcript, Duration::from_secs(1));
        let (notifier, push) = StructuralNotifier::channel(MutationFilter::default());
        detector.add_source(Box::new(push));
        let handle = detector.start().await.expect("start");

        notifier.notify(Mutation::new("#chat"));
        tokio::time::sleep(Duration::from_millis(400)).await;
        notifier.notify(Mutation::new("#chat"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poll_fires_only_on_signature_change() {
        let transcript = MemoryTranscript::new();
        transcript.push(Role::Other, "hello");
        let source: Arc<dyn TranscriptSource> = Arc::new(transcript.clone());
        let (mut detector, passes) = counting_detector(&transcript, Duration::from_millis(10));
        detector.add_source(Box::new(PollSource::new(source, Duration::from_secs(10))));
        let handle = detector.start().await.expect("start");

        // first tick sees no prior signature
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 1);

        transcript.push(Role::Me, "again");
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn start_requires_callback() {
        let source: Arc<dyn TranscriptSource> = Arc::new(MemoryTranscript::new());
        let detector = ChangeDetector::new(source, Duration::from_millis(300));
        assert!(matches!(detector.start().await, Err(Error::InvalidArgument(_))));
    }

    struct Flaky {
        failures_left: u32,
        attempts: Arc<AtomicUsize>,
    }

    impl ChangeSource for Flaky {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn spawn(&mut self, _ctx: SourceContext) -> Result<JoinHandle<()>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::SourceUnavailable("not yet".to_string()));
            }
            Ok(tokio::spawn(async {}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_attach_failures_are_retried() {
        let transcript = MemoryTranscript::new();
        let (detector, _) = counting_detector(&transcript, Duration::from_millis(10));
        let mut detector = detector.with_retry(3, Duration::from_millis(200));
        let attempts = Arc::new(AtomicUsize::new(0));
        detector.add_source(Box::new(Flaky {
            failures_left: 2,
            attempts: Arc::clone(&attempts),
        }));
        let handle = detector.start().await.expect("start");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handle.attached(), ["flaky".to_string()]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_source_detached() {
        let transcript = MemoryTranscript::new();
        let (detector, _) = counting_detector(&transcript, Duration::from_millis(10));
        let mut detector = detector.with_retry(2, Duration::from_millis(200));
        let attempts = Arc::new(AtomicUsize::new(0));
        detector.add_source(Box::new(Flaky {
            failures_left: 10,
            attempts: Arc::clone(&attempts),
        }));
        let handle = detector.start().await.expect("start");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(handle.attached().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn file_watch_requires_existing_directory() {
        let mut source = FileWatchSource::new(
            "/definitely/not/here/chat.jsonl",
            MutationFilter::default(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let ctx = SourceContext {
            firings: tx,
            last_signature: Arc::new(Mutex::new(None)),
            shutdown,
        };
        let err = source.spawn(ctx).err().expect("must fail");
        assert!(err.is_transient());
    }
}
