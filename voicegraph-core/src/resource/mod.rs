//! `ResourceManager` — single-flight owner of the shared streaming engine.
//!
//! ## Lifecycle
//!
//! ```text
//! uninitialized ──load()──► loading ──► ready ──generate()──► generating
//!                              │                     │            │
//!                              ▼                     ◄── ready ◄──┤
//!                            error ◄─────────────────────────────-┘
//!        (unload() returns any state to uninitialized)
//! ```
//!
//! Two independent monotonic counters guard staleness: `generation_seq`
//! invalidates superseded generations (including their streaming callbacks),
//! `resource_epoch` invalidates an entire in-flight initialization after a
//! teardown. Cancelled work may still run to completion in the background;
//! every resumption point re-checks its counter and discards stale results.
//!
//! Locks are never held across an await. The engine handle, the snapshot,
//! and both counters are owned exclusively by this manager — external code
//! reads snapshot copies or calls the four operations.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::engine::{DiagramEngine, EngineLoader, GenerationRequest, ProgressFn};
use crate::error::{Result, VoicegraphError};
use crate::sequence::SequenceCounter;

/// Broadcast capacity: 256 snapshots buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Default instruction preamble sent with every generation.
const DEFAULT_SYSTEM_PROMPT: &str = "You turn a spoken transcript into diagram \
markup. Reply with the diagram source only, no commentary.";

/// Configuration for `ResourceManager`.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Wall-clock budget for one generation (ms). Default: 10 000.
    pub default_timeout_ms: u64,
    /// Instruction preamble used when a call supplies none.
    pub system_prompt: String,
    /// Default cap on generated length.
    pub max_output_tokens: u32,
    /// Default sampling randomness.
    pub temperature: f32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_output_tokens: 1_024,
            temperature: 0.2,
        }
    }
}

/// Per-call overrides; unset fields fall back to `ResourceConfig`.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub system_prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_ms: Option<u64>,
}

impl GenerationOptions {
    fn resolve(&self, prompt: &str, config: &ResourceConfig) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| config.system_prompt.clone()),
            max_output_tokens: self.max_output_tokens.unwrap_or(config.max_output_tokens),
            temperature: self.temperature.unwrap_or(config.temperature),
        }
    }
}

/// Current state of the shared engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// No engine loaded and no load in progress.
    Uninitialized,
    /// Initialization running.
    Loading,
    /// Engine loaded and idle.
    Ready,
    /// A generation is streaming.
    Generating,
    /// Load or generation failed; retryable via another `load()`/`generate()`.
    Error,
}

/// Read-only copy of the manager state, broadcast on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub status: ResourceStatus,
    /// Fractional load progress in [0, 1].
    pub load_progress: f32,
    pub last_error: Option<String>,
    /// Text streamed so far by the current (or last) generation.
    pub streamed_output: String,
}

/// Cloneable settlement of the single in-flight initialization.
#[derive(Debug, Clone)]
enum LoadOutcome {
    Ready,
    Cancelled,
    Failed(String),
}

impl LoadOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Cancelled => Err(VoicegraphError::Cancelled),
            Self::Failed(msg) => Err(VoicegraphError::EngineLoad(msg)),
        }
    }
}

struct ManagerInner {
    status: ResourceStatus,
    load_progress: f32,
    last_error: Option<String>,
    streamed_output: String,
    handle: Option<Arc<dyn DiagramEngine>>,
    /// `Some` exactly while an initialization task is in flight; every
    /// `load()` caller parks a oneshot here and the task settles them all.
    load_waiters: Option<Vec<oneshot::Sender<LoadOutcome>>>,
}

impl ManagerInner {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            status: self.status,
            load_progress: self.load_progress,
            last_error: self.last_error.clone(),
            streamed_output: self.streamed_output.clone(),
        }
    }
}

struct ManagerShared {
    inner: Mutex<ManagerInner>,
    snapshot_tx: broadcast::Sender<ResourceSnapshot>,
    generation_seq: SequenceCounter,
    resource_epoch: SequenceCounter,
}

impl ManagerShared {
    fn publish(&self, inner: &ManagerInner) {
        let _ = self.snapshot_tx.send(inner.snapshot());
    }
}

/// Single-flight owner of one expensive streaming engine.
///
/// `ResourceManager` is `Send + Sync`; wrap in `Arc` to share between the
/// scheduler's generate capability and host observers.
pub struct ResourceManager {
    loader: Arc<dyn EngineLoader>,
    config: ResourceConfig,
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    pub fn new(loader: Arc<dyn EngineLoader>, config: ResourceConfig) -> Self {
        let (snapshot_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            loader,
            config,
            shared: Arc::new(ManagerShared {
                inner: Mutex::new(ManagerInner {
                    status: ResourceStatus::Uninitialized,
                    load_progress: 0.0,
                    last_error: None,
                    streamed_output: String::new(),
                    handle: None,
                    load_waiters: None,
                }),
                snapshot_tx,
                generation_seq: SequenceCounter::new(),
                resource_epoch: SequenceCounter::new(),
            }),
        }
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Read-only copy of the current state.
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.shared.inner.lock().snapshot()
    }

    pub fn status(&self) -> ResourceStatus {
        self.shared.inner.lock().status
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.inner.lock().handle.is_some()
    }

    /// Idempotently ensure the engine is loaded.
    ///
    /// A live handle settles immediately (clearing any stale generation
    /// error — a failed generation does not invalidate the engine). A load
    /// already in flight is joined, never duplicated.
    ///
    /// # Errors
    /// - `VoicegraphError::Cancelled` if `unload()` tore the load down.
    /// - `VoicegraphError::EngineLoad` if the backend failed to initialize.
    pub async fn load(&self) -> Result<()> {
        enum Entry {
            Settled,
            Join(oneshot::Receiver<LoadOutcome>),
            Begin(oneshot::Receiver<LoadOutcome>, u64),
        }

        let entry = {
            let mut inner = self.shared.inner.lock();
            if inner.handle.is_some() {
                if inner.last_error.is_some() || inner.status == ResourceStatus::Error {
                    inner.last_error = None;
                    inner.status = ResourceStatus::Ready;
                    self.shared.publish(&inner);
                }
                Entry::Settled
            } else {
                let (tx, rx) = oneshot::channel();
                match inner.load_waiters {
                    Some(ref mut waiters) => {
                        waiters.push(tx);
                        Entry::Join(rx)
                    }
                    None => {
                        inner.load_waiters = Some(vec![tx]);
                        inner.status = ResourceStatus::Loading;
                        inner.load_progress = 0.0;
                        inner.last_error = None;
                        self.shared.publish(&inner);
                        Entry::Begin(rx, self.shared.resource_epoch.current())
                    }
                }
            }
        };

        let rx = match entry {
            Entry::Settled => return Ok(()),
            Entry::Join(rx) => rx,
            Entry::Begin(rx, epoch) => {
                self.spawn_load_task(epoch);
                rx
            }
        };

        match rx.await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(VoicegraphError::EngineLoad(
                "engine load task dropped".into(),
            )),
        }
    }

    fn spawn_load_task(&self, epoch: u64) {
        let loader = Arc::clone(&self.loader);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            info!("engine load started");
            let progress: ProgressFn = {
                let shared = Arc::clone(&shared);
                Arc::new(move |fraction: f32| {
                    // A progress event for a stale epoch is dropped.
                    if !shared.resource_epoch.is_current(epoch) {
                        return;
                    }
                    let mut inner = shared.inner.lock();
                    if inner.status == ResourceStatus::Loading {
                        inner.load_progress = fraction.clamp(0.0, 1.0);
                        shared.publish(&inner);
                    }
                })
            };

            let result = loader.load(progress).await;

            let (waiters, outcome, discarded) = {
                let mut inner = shared.inner.lock();
                let waiters = inner.load_waiters.take();
                match result {
                    Ok(engine) => {
                        if shared.resource_epoch.is_current(epoch) {
                            inner.handle = Some(engine);
                            inner.status = ResourceStatus::Ready;
                            inner.load_progress = 1.0;
                            inner.last_error = None;
                            shared.publish(&inner);
                            info!("engine ready");
                            (waiters, LoadOutcome::Ready, None)
                        } else {
                            // Torn down mid-load: the freshly built engine is
                            // never promoted.
                            warn!("engine load finished under a stale epoch; discarding");
                            (waiters, LoadOutcome::Cancelled, Some(engine))
                        }
                    }
                    Err(e) => {
                        if shared.resource_epoch.is_current(epoch) {
                            inner.status = ResourceStatus::Error;
                            inner.load_progress = 0.0;
                            inner.last_error = Some(e.to_string());
                            shared.publish(&inner);
                            warn!(error = %e, "engine load failed");
                            (waiters, LoadOutcome::Failed(e.to_string()), None)
                        } else {
                            (waiters, LoadOutcome::Cancelled, None)
                        }
                    }
                }
            };

            if let Some(engine) = discarded {
                engine.release().await;
            }
            if let Some(waiters) = waiters {
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        });
    }

    /// Run one generation, streaming increments into the snapshot.
    ///
    /// A newer `generate()` or `abort()` supersedes this call: its eventual
    /// settlement becomes `Cancelled` and nothing it produced reaches the
    /// snapshot from that point on.
    ///
    /// # Errors
    /// - `VoicegraphError::Cancelled` when superseded or aborted.
    /// - `VoicegraphError::Timeout` when the wall-clock budget is exceeded.
    /// - `VoicegraphError::EngineLoad` / `Generation` on backend failure.
    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        // A newer request always wins: best-effort interrupt first.
        let running = self.shared.inner.lock().handle.clone();
        if let Some(engine) = running {
            engine.interrupt();
        }

        let seq = self.shared.generation_seq.advance();
        {
            let mut inner = self.shared.inner.lock();
            inner.streamed_output.clear();
            inner.last_error = None;
            self.shared.publish(&inner);
        }

        if self.shared.inner.lock().handle.is_none() {
            self.load().await?;
        }
        // Superseded while waiting for the load: never start streaming.
        if !self.shared.generation_seq.is_current(seq) {
            debug!(seq, "generation superseded during load");
            return Err(VoicegraphError::Cancelled);
        }
        let engine = match self.shared.inner.lock().handle.clone() {
            Some(engine) => engine,
            // Unloaded between the load and here.
            None => return Err(VoicegraphError::Cancelled),
        };

        {
            let mut inner = self.shared.inner.lock();
            inner.status = ResourceStatus::Generating;
            self.shared.publish(&inner);
        }

        let request = options.resolve(prompt, &self.config);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let budget = Duration::from_millis(timeout_ms);

        match tokio::time::timeout(budget, self.consume_stream(&engine, request, seq)).await {
            Err(_elapsed) => {
                engine.interrupt();
                if self.shared.generation_seq.is_current(seq) {
                    let mut inner = self.shared.inner.lock();
                    inner.status = ResourceStatus::Error;
                    inner.last_error = Some(format!("generation timed out after {timeout_ms} ms"));
                    self.shared.publish(&inner);
                    warn!(seq, timeout_ms, "generation timed out");
                    Err(VoicegraphError::Timeout { ms: timeout_ms })
                } else {
                    Err(VoicegraphError::Cancelled)
                }
            }
            Ok(Ok(text)) => {
                if self.shared.generation_seq.is_current(seq) {
                    let mut inner = self.shared.inner.lock();
                    inner.status = ResourceStatus::Ready;
                    self.shared.publish(&inner);
                    debug!(seq, chars = text.len(), "generation complete");
                    Ok(text)
                } else {
                    // The call itself succeeded, but a newer attempt owns
                    // the snapshot now.
                    Err(VoicegraphError::Cancelled)
                }
            }
            Ok(Err(e)) => {
                if e.is_cancellation() {
                    return Err(e);
                }
                if !self.shared.generation_seq.is_current(seq) {
                    return Err(VoicegraphError::Cancelled);
                }
                let mut inner = self.shared.inner.lock();
                inner.status = ResourceStatus::Error;
                inner.last_error = Some(e.to_string());
                self.shared.publish(&inner);
                warn!(seq, error = %e, "generation failed");
                Err(e)
            }
        }
    }

    async fn consume_stream(
        &self,
        engine: &Arc<dyn DiagramEngine>,
        request: GenerationRequest,
        seq: u64,
    ) -> Result<String> {
        let mut rx = engine.stream(request).await?;
        let mut text = String::new();
        while let Some(delta) = rx.recv().await {
            let delta = delta?;
            // Superseded: stop consuming; the outer settlement normalizes
            // this call to Cancelled.
            if !self.shared.generation_seq.is_current(seq) {
                break;
            }
            text.push_str(&delta);
            let mut inner = self.shared.inner.lock();
            inner.streamed_output.push_str(&delta);
            self.shared.publish(&inner);
        }
        Ok(text)
    }

    /// Invalidate any in-flight generation intent, even one still waiting on
    /// the loading phase. If a generation is streaming, interrupt it and
    /// return to ready, keeping whatever partial output already arrived.
    pub fn abort(&self) {
        self.shared.generation_seq.advance();
        let mut inner = self.shared.inner.lock();
        if inner.status == ResourceStatus::Generating {
            if let Some(engine) = &inner.handle {
                engine.interrupt();
            }
            inner.status = ResourceStatus::Ready;
            inner.last_error = None;
            self.shared.publish(&inner);
            info!("generation aborted; partial output preserved");
        }
    }

    /// Tear everything down. Safe from any state: pending loads reject with
    /// a cancellation, stale progress/result callbacks are dropped, and the
    /// live engine (if any) is released.
    pub async fn unload(&self) {
        self.shared.generation_seq.advance();
        let (engine, waiters) = {
            let mut inner = self.shared.inner.lock();
            // Advanced under the lock so a concurrent load() observes a
            // consistent epoch.
            self.shared.resource_epoch.advance();
            let engine = inner.handle.take();
            let waiters = inner.load_waiters.take();
            inner.status = ResourceStatus::Uninitialized;
            inner.load_progress = 0.0;
            inner.last_error = None;
            inner.streamed_output.clear();
            self.shared.publish(&inner);
            (engine, waiters)
        };

        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(LoadOutcome::Cancelled);
            }
        }
        if let Some(engine) = engine {
            engine.interrupt();
            engine.release().await;
        }
        info!("engine unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::engine::ChunkReceiver;

    struct LoadScript {
        gate: Option<oneshot::Receiver<()>>,
        result: std::result::Result<Arc<ScriptedEngine>, String>,
    }

    struct ScriptedLoader {
        scripts: Mutex<VecDeque<LoadScript>>,
        calls: AtomicUsize,
    }

    impl ScriptedLoader {
        fn new(scripts: Vec<LoadScript>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineLoader for ScriptedLoader {
        async fn load(&self, progress: ProgressFn) -> Result<Arc<dyn DiagramEngine>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .pop_front()
                .expect("unscripted load call");
            progress(0.5);
            if let Some(gate) = script.gate {
                let _ = gate.await;
            }
            match script.result {
                Ok(engine) => Ok(engine as Arc<dyn DiagramEngine>),
                Err(msg) => Err(VoicegraphError::EngineLoad(msg)),
            }
        }
    }

    struct ScriptedEngine {
        streams: Mutex<VecDeque<ChunkReceiver>>,
        stream_calls: AtomicUsize,
        interrupts: AtomicUsize,
        releases: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(streams: Vec<ChunkReceiver>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                stream_calls: AtomicUsize::new(0),
                interrupts: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            })
        }

        fn stream_calls(&self) -> usize {
            self.stream_calls.load(Ordering::SeqCst)
        }

        fn interrupts(&self) -> usize {
            self.interrupts.load(Ordering::SeqCst)
        }

        fn releases(&self) -> usize {
            self.releases.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiagramEngine for ScriptedEngine {
        async fn stream(&self, _request: GenerationRequest) -> Result<ChunkReceiver> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().pop_front() {
                Some(rx) => Ok(rx),
                None => {
                    // Unscripted stream: completes immediately with no output.
                    let (_tx, rx) = mpsc::channel(1);
                    Ok(rx)
                }
            }
        }

        fn interrupt(&self) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
        }

        async fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ready_stream(chunks: &[std::result::Result<&str, &str>]) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let item = match chunk {
                Ok(text) => Ok((*text).to_string()),
                Err(msg) => Err(VoicegraphError::Generation((*msg).to_string())),
            };
            tx.try_send(item).expect("scripted stream overflow");
        }
        rx
    }

    fn open_stream() -> (mpsc::Sender<Result<String>>, ChunkReceiver) {
        mpsc::channel(8)
    }

    fn immediate_loader(engine: Arc<ScriptedEngine>) -> Arc<ScriptedLoader> {
        ScriptedLoader::new(vec![LoadScript {
            gate: None,
            result: Ok(engine),
        }])
    }

    fn gated_loader(engine: Arc<ScriptedEngine>) -> (Arc<ScriptedLoader>, oneshot::Sender<()>) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let loader = ScriptedLoader::new(vec![LoadScript {
            gate: Some(gate_rx),
            result: Ok(engine),
        }]);
        (loader, gate_tx)
    }

    fn manager_with(loader: Arc<ScriptedLoader>) -> Arc<ResourceManager> {
        Arc::new(ResourceManager::new(loader, ResourceConfig::default()))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > Duration::from_secs(2) {
                panic!("condition not met in time");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_loads_initialize_exactly_once() {
        let engine = ScriptedEngine::new(vec![]);
        let (loader, gate) = gated_loader(engine);
        let manager = manager_with(Arc::clone(&loader));

        let m1 = Arc::clone(&manager);
        let first = tokio::spawn(async move { m1.load().await });
        let m2 = Arc::clone(&manager);
        let second = tokio::spawn(async move { m2.load().await });

        wait_until(|| manager.status() == ResourceStatus::Loading).await;
        gate.send(()).expect("load task gone");

        first.await.unwrap().expect("first load");
        second.await.unwrap().expect("second load");
        assert_eq!(loader.calls(), 1);
        assert_eq!(manager.status(), ResourceStatus::Ready);
        assert!((manager.snapshot().load_progress - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unload_rejects_pending_load_and_discards_the_stale_engine() {
        let engine = ScriptedEngine::new(vec![]);
        let (loader, gate) = gated_loader(Arc::clone(&engine));
        let manager = manager_with(loader);

        let m = Arc::clone(&manager);
        let pending = tokio::spawn(async move { m.load().await });
        wait_until(|| manager.status() == ResourceStatus::Loading).await;

        manager.unload().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(manager.status(), ResourceStatus::Uninitialized);

        // The initialization finishes under a stale epoch: the freshly built
        // engine must be released, never promoted.
        gate.send(()).ok();
        wait_until(|| engine.releases() == 1).await;
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn generate_lazily_loads_and_streams_increments_into_the_snapshot() {
        let engine = ScriptedEngine::new(vec![ready_stream(&[
            Ok("flowchart TD"),
            Ok("\n    a --> b"),
        ])]);
        let manager = manager_with(immediate_loader(engine));

        let text = manager
            .generate("draw it", &GenerationOptions::default())
            .await
            .expect("generation");

        assert_eq!(text, "flowchart TD\n    a --> b");
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Ready);
        assert_eq!(snap.streamed_output, text);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn second_generate_supersedes_the_first() {
        let (tx1, rx1) = open_stream();
        let engine = ScriptedEngine::new(vec![rx1, ready_stream(&[Ok("second")])]);
        let manager = manager_with(immediate_loader(Arc::clone(&engine)));

        let m = Arc::clone(&manager);
        let first = tokio::spawn(async move {
            m.generate("one", &GenerationOptions::default()).await
        });
        wait_until(|| engine.stream_calls() == 1).await;
        tx1.send(Ok("first".into())).await.unwrap();
        wait_until(|| manager.snapshot().streamed_output == "first").await;

        let second = manager
            .generate("two", &GenerationOptions::default())
            .await
            .expect("second generation");
        assert_eq!(second, "second");
        assert!(engine.interrupts() >= 1);

        // Let the superseded call settle: it must normalize to Cancelled
        // even though its stream ended normally.
        drop(tx1);
        let first_err = first.await.unwrap().unwrap_err();
        assert!(first_err.is_cancellation());
        assert_eq!(manager.snapshot().streamed_output, "second");
        assert_eq!(manager.status(), ResourceStatus::Ready);
    }

    #[tokio::test]
    async fn abort_keeps_partial_output_and_records_no_error() {
        let (tx, rx) = open_stream();
        let engine = ScriptedEngine::new(vec![rx]);
        let manager = manager_with(immediate_loader(Arc::clone(&engine)));

        let m = Arc::clone(&manager);
        let pending = tokio::spawn(async move {
            m.generate("one", &GenerationOptions::default()).await
        });
        wait_until(|| engine.stream_calls() == 1).await;
        tx.send(Ok("partial".into())).await.unwrap();
        wait_until(|| manager.snapshot().streamed_output == "partial").await;

        manager.abort();
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Ready);
        assert_eq!(snap.streamed_output, "partial");
        assert!(snap.last_error.is_none());
        assert!(engine.interrupts() >= 1);

        drop(tx);
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn a_silent_stream_times_out_with_a_distinct_error() {
        let (_tx, rx) = open_stream();
        let engine = ScriptedEngine::new(vec![rx]);
        let manager = manager_with(immediate_loader(engine));

        let options = GenerationOptions {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let started = tokio::time::Instant::now();
        let err = manager.generate("x", &options).await.unwrap_err();

        assert!(err.is_timeout(), "expected Timeout, got {err:?}");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250));
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Error);
        assert!(snap.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn abort_during_load_cancels_the_generation_before_it_streams() {
        let engine = ScriptedEngine::new(vec![]);
        let (loader, gate) = gated_loader(Arc::clone(&engine));
        let manager = manager_with(loader);

        let m = Arc::clone(&manager);
        let pending = tokio::spawn(async move {
            m.generate("one", &GenerationOptions::default()).await
        });
        wait_until(|| manager.status() == ResourceStatus::Loading).await;

        manager.abort();
        gate.send(()).expect("load task gone");

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(engine.stream_calls(), 0);
        // The load itself still promoted the engine.
        assert!(manager.is_loaded());
        assert_eq!(manager.status(), ResourceStatus::Ready);
    }

    #[tokio::test]
    async fn load_failure_is_retryable_without_recreating_the_manager() {
        let engine = ScriptedEngine::new(vec![]);
        let loader = ScriptedLoader::new(vec![
            LoadScript {
                gate: None,
                result: Err("weights missing".into()),
            },
            LoadScript {
                gate: None,
                result: Ok(engine),
            },
        ]);
        let manager = manager_with(Arc::clone(&loader));

        let err = manager.load().await.unwrap_err();
        assert!(matches!(err, VoicegraphError::EngineLoad(_)));
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Error);
        assert!(snap.last_error.unwrap().contains("weights missing"));

        manager.load().await.expect("retry load");
        assert_eq!(manager.status(), ResourceStatus::Ready);
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn a_generation_error_never_invalidates_the_live_engine() {
        let engine = ScriptedEngine::new(vec![ready_stream(&[Err("backend exploded")])]);
        let loader = immediate_loader(engine);
        let manager = manager_with(Arc::clone(&loader));

        let err = manager
            .generate("one", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoicegraphError::Generation(_)));
        assert_eq!(manager.status(), ResourceStatus::Error);

        // A live handle means load() settles immediately: no reinit.
        manager.load().await.expect("load with live handle");
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Ready);
        assert!(snap.last_error.is_none());
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn unload_from_ready_releases_the_engine_and_resets_the_snapshot() {
        let engine = ScriptedEngine::new(vec![ready_stream(&[Ok("out")])]);
        let manager = manager_with(immediate_loader(Arc::clone(&engine)));

        manager
            .generate("one", &GenerationOptions::default())
            .await
            .expect("generation");
        manager.unload().await;

        assert_eq!(engine.releases(), 1);
        let snap = manager.snapshot();
        assert_eq!(snap.status, ResourceStatus::Uninitialized);
        assert_eq!(snap.load_progress, 0.0);
        assert!(snap.last_error.is_none());
        assert!(snap.streamed_output.is_empty());
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn snapshots_broadcast_on_every_change() {
        let engine = ScriptedEngine::new(vec![ready_stream(&[Ok("a"), Ok("b")])]);
        let manager = manager_with(immediate_loader(engine));
        let mut rx = manager.subscribe();

        manager
            .generate("one", &GenerationOptions::default())
            .await
            .expect("generation");

        let mut streamed = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            streamed.push(snap);
        }
        assert!(streamed.iter().any(|s| s.status == ResourceStatus::Loading));
        assert!(streamed
            .iter()
            .any(|s| s.status == ResourceStatus::Generating && s.streamed_output == "a"));
        assert!(streamed
            .iter()
            .any(|s| s.status == ResourceStatus::Ready && s.streamed_output == "ab"));
    }

    #[test]
    fn snapshot_serializes_with_camel_case_and_lowercase_status() {
        let snap = ResourceSnapshot {
            status: ResourceStatus::Generating,
            load_progress: 0.5,
            last_error: None,
            streamed_output: "flowchart TD".into(),
        };

        let json = serde_json::to_value(&snap).expect("serialize snapshot");
        assert_eq!(json["status"], "generating");
        assert_eq!(json["loadProgress"], 0.5);
        assert!(json["lastError"].is_null());
        assert_eq!(json["streamedOutput"], "flowchart TD");

        let round_trip: ResourceSnapshot =
            serde_json::from_value(json).expect("deserialize snapshot");
        assert_eq!(round_trip.status, ResourceStatus::Generating);
    }
}
