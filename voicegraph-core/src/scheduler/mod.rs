//! `TriggerScheduler` — continuous regeneration from a live transcript.
//!
//! ## Tick cycle
//!
//! ```text
//! sleep(current interval) ──► pull transcript ──► changed & long enough?
//!        ▲                                              │ yes
//!        │                                              ▼
//!        └── re-arm single-shot ◄── recompute interval, spawn generate(task)
//! ```
//!
//! The tick re-arms itself rather than running on a fixed-period timer, so
//! adaptive backoff takes effect on the next tick without restarting
//! anything. Attempts are fire-and-forget: each one runs on its own spawned
//! task and reports back through the settlement path; the scheduler loop
//! never blocks on a generation.
//!
//! Staleness is decided purely by sequence comparison, not by the
//! active-attempt bookkeeping: no result may update accepted state or fire
//! the callback once a strictly newer attempt has succeeded, regardless of
//! completion order. The bounded attempt set only limits how many attempts
//! count as active for backpressure-style observation.

mod attempts;
mod history;

pub use attempts::AttemptSet;
pub use history::OutputHistory;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::sequence;

/// Pull-based transcript source; may return a different value on every call.
pub type TranscriptSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Injected generation capability. `Ok(None)` means the attempt produced
/// nothing; an `Err` marks the attempt failed.
pub type GenerateFn =
    Arc<dyn Fn(TriggerTask) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// Invoked for every settled, non-stale, non-errored attempt — including
/// those that produced nothing.
pub type SettleFn = Arc<dyn Fn(Option<&str>, &TriggerTask) + Send + Sync>;

/// One generation attempt, immutable once created.
#[derive(Debug, Clone)]
pub struct TriggerTask {
    /// Sequence number: unique, assigned in trigger order.
    pub id: u64,
    /// Transcript snapshot this attempt was started from.
    pub transcript: String,
    pub created_at: Instant,
}

/// Configuration for `TriggerScheduler`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum delay between ticks (ms). Default: 1000.
    pub interval_baseline_ms: u64,
    /// Growth factor applied as triggers accumulate (ms). Default: 2500.
    pub interval_scale_ms: u64,
    /// Hard ceiling on the tick delay (ms). Default: 8000.
    pub max_interval_ms: u64,
    /// Bookkeeping ceiling on simultaneously tracked attempts. Default: 3.
    pub max_concurrent_attempts: usize,
    /// Trimmed-length floor (chars) below which no trigger fires. Default: 10.
    pub min_transcript_length: usize,
    /// Capacity of the circular output buffer. Default: 20.
    pub max_history_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_baseline_ms: 1_000,
            interval_scale_ms: 2_500,
            max_interval_ms: 8_000,
            max_concurrent_attempts: 3,
            min_transcript_length: 10,
            max_history_size: 20,
        }
    }
}

/// Read-only copy of the scheduling state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub active: bool,
    /// Count of triggers fired since the last hard reset.
    pub sequence_counter: u64,
    /// Sequence of the last accepted attempt, if any.
    pub last_accepted_sequence: Option<u64>,
    /// Transcript of the most recent successful attempt.
    pub last_accepted_transcript: String,
    /// Accepted outputs, oldest first.
    pub history: Vec<String>,
    pub active_attempts: usize,
    pub current_interval_ms: u64,
}

struct SchedulerInner {
    active: bool,
    /// Bumped by `start()`/`stop()`; ticks and settlements carrying a stale
    /// epoch are dropped entirely.
    epoch: u64,
    sequence_counter: u64,
    last_accepted_sequence: Option<u64>,
    last_accepted_transcript: String,
    /// Transcript that started the most recent attempt (tick-change check).
    last_triggered_transcript: Option<String>,
    current_interval_ms: u64,
    attempts: AttemptSet,
    history: OutputHistory,
}

impl SchedulerInner {
    fn reset(&mut self, config: &SchedulerConfig) {
        self.sequence_counter = 0;
        self.last_accepted_sequence = None;
        self.last_accepted_transcript.clear();
        self.last_triggered_transcript = None;
        self.current_interval_ms = config.interval_baseline_ms;
        self.attempts.clear();
        self.history.clear();
    }
}

/// Continuous trigger scheduler.
///
/// `TriggerScheduler` is `Send + Sync`; all mutable state sits behind one
/// mutex owned by the instance. The injected capabilities must not reach
/// back into scheduler state.
pub struct TriggerScheduler {
    config: SchedulerConfig,
    generate: GenerateFn,
    on_settled: SettleFn,
    inner: Arc<Mutex<SchedulerInner>>,
}

impl TriggerScheduler {
    pub fn new(config: SchedulerConfig, generate: GenerateFn, on_settled: SettleFn) -> Self {
        let inner = SchedulerInner {
            active: false,
            epoch: 0,
            sequence_counter: 0,
            last_accepted_sequence: None,
            last_accepted_transcript: String::new(),
            last_triggered_transcript: None,
            current_interval_ms: config.interval_baseline_ms,
            attempts: AttemptSet::new(config.max_concurrent_attempts),
            history: OutputHistory::new(config.max_history_size),
        };
        Self {
            config,
            generate,
            on_settled,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Begin self-rescheduling ticks against `source`.
    ///
    /// Idempotent while running: a second call is a no-op.
    pub fn start(&self, source: TranscriptSource) {
        let epoch = {
            let mut inner = self.inner.lock();
            if inner.active {
                debug!("scheduler already running");
                return;
            }
            inner.active = true;
            inner.epoch += 1;
            inner.current_interval_ms = self.config.interval_baseline_ms;
            inner.epoch
        };
        info!(
            baseline_ms = self.config.interval_baseline_ms,
            "scheduler started"
        );

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let generate = Arc::clone(&self.generate);
        let on_settled = Arc::clone(&self.on_settled);

        tokio::spawn(async move {
            loop {
                let delay_ms = {
                    let guard = inner.lock();
                    if !guard.active || guard.epoch != epoch {
                        break;
                    }
                    guard.current_interval_ms
                };
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Re-check after the wait; stop() may have landed mid-sleep.
                {
                    let guard = inner.lock();
                    if !guard.active || guard.epoch != epoch {
                        break;
                    }
                }
                let transcript = (source)();

                let task = {
                    let mut guard = inner.lock();
                    if !guard.active || guard.epoch != epoch {
                        break;
                    }
                    evaluate_tick_locked(&mut guard, &config, transcript)
                };
                if let Some(task) = task {
                    spawn_attempt(
                        Arc::clone(&inner),
                        Arc::clone(&generate),
                        Arc::clone(&on_settled),
                        task,
                        epoch,
                    );
                }
            }
            debug!("scheduler loop exited");
        });
    }

    /// Cancel the pending tick and hard-reset all scheduling state.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.active = false;
        inner.epoch += 1;
        inner.reset(&self.config);
        info!("scheduler stopped; state reset");
    }

    /// Evaluate one attempt for `transcript` right now, independent of the
    /// tick timer. Returns whether an attempt was started.
    pub fn check_and_trigger(&self, transcript: &str) -> bool {
        if trimmed_len(transcript) < self.config.min_transcript_length {
            return false;
        }
        let (task, epoch) = {
            let mut inner = self.inner.lock();
            let task = fire_trigger_locked(&mut inner, &self.config, transcript.to_string());
            (task, inner.epoch)
        };
        spawn_attempt(
            Arc::clone(&self.inner),
            Arc::clone(&self.generate),
            Arc::clone(&self.on_settled),
            task,
            epoch,
        );
        true
    }

    /// Read-only copy of the scheduling state.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.inner.lock();
        SchedulerSnapshot {
            active: inner.active,
            sequence_counter: inner.sequence_counter,
            last_accepted_sequence: inner.last_accepted_sequence,
            last_accepted_transcript: inner.last_accepted_transcript.clone(),
            history: inner.history.to_vec(),
            active_attempts: inner.attempts.len(),
            current_interval_ms: inner.current_interval_ms,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().active
    }

    pub fn active_attempt_count(&self) -> usize {
        self.inner.lock().attempts.len()
    }
}

fn trimmed_len(transcript: &str) -> usize {
    transcript.trim().chars().count()
}

fn evaluate_tick_locked(
    inner: &mut SchedulerInner,
    config: &SchedulerConfig,
    transcript: String,
) -> Option<TriggerTask> {
    if trimmed_len(&transcript) < config.min_transcript_length {
        return None;
    }
    if inner.last_triggered_transcript.as_deref() == Some(transcript.as_str()) {
        return None;
    }
    Some(fire_trigger_locked(inner, config, transcript))
}

fn fire_trigger_locked(
    inner: &mut SchedulerInner,
    config: &SchedulerConfig,
    transcript: String,
) -> TriggerTask {
    let id = inner.sequence_counter;
    inner.sequence_counter += 1;
    let task = TriggerTask {
        id,
        transcript: transcript.clone(),
        created_at: Instant::now(),
    };
    // Eviction at capacity only drops bookkeeping; the evicted attempt's
    // call keeps running and settles through the normal staleness check.
    inner.attempts.insert(id, task.created_at);

    // Sub-linear backoff: early triggers stay responsive, sustained voice
    // input slows polling instead of flooding the shared resource.
    let triggers = inner.sequence_counter;
    let raw = config.interval_baseline_ms as f64
        + ((triggers + 1) as f64).log2() * config.interval_scale_ms as f64;
    inner.current_interval_ms = (raw.round() as u64).min(config.max_interval_ms);
    inner.last_triggered_transcript = Some(transcript);

    debug!(
        task_id = id,
        interval_ms = inner.current_interval_ms,
        active = inner.attempts.len(),
        "trigger fired"
    );
    task
}

fn spawn_attempt(
    inner: Arc<Mutex<SchedulerInner>>,
    generate: GenerateFn,
    on_settled: SettleFn,
    task: TriggerTask,
    epoch: u64,
) {
    // The capability is invoked at trigger time; only its future runs on
    // the spawned task, so the scheduler never blocks on an attempt.
    let attempt = (generate)(task.clone());
    tokio::spawn(async move {
        let outcome = attempt.await;
        settle(&inner, &on_settled, task, epoch, outcome);
    });
}

fn settle(
    inner: &Mutex<SchedulerInner>,
    on_settled: &SettleFn,
    task: TriggerTask,
    epoch: u64,
    outcome: Result<Option<String>>,
) {
    let accepted = {
        let mut guard = inner.lock();
        if guard.epoch != epoch {
            debug!(task_id = task.id, "settlement after reset; dropping");
            return;
        }
        guard.attempts.remove(task.id);
        match outcome {
            Err(e) => {
                // Attempt failures never stop the scheduler.
                debug!(task_id = task.id, error = %e, "attempt failed; dropping");
                return;
            }
            Ok(result) => {
                if sequence::superseded(task.id, guard.last_accepted_sequence) {
                    debug!(task_id = task.id, "attempt superseded; discarding result");
                    return;
                }
                let result = result.filter(|text| !text.is_empty());
                if let Some(text) = &result {
                    guard.last_accepted_sequence = Some(task.id);
                    guard.last_accepted_transcript = task.transcript.clone();
                    guard.history.push(text.clone());
                }
                result
            }
        }
    };
    on_settled(accepted.as_deref(), &task);
}
