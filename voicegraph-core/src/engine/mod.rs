//! Streaming diagram-engine abstraction.
//!
//! The `EngineLoader`/`DiagramEngine` pair decouples the resource manager
//! from any concrete backend (stub, local GGUF runner, remote provider).
//! Loading is the expensive one-time step; a loaded engine then serves one
//! generation at a time, streaming increments over a channel.
//!
//! `interrupt` is best-effort and cooperative: a backend may keep producing
//! after it is called, and the manager discards anything stale on its side.

pub mod stub;

pub use stub::{StubEngine, StubLoader};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Fractional load progress callback, guarded by the caller's epoch check.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Stream of generated text increments. Channel close means the generation
/// ran to completion; an `Err` item means it failed mid-stream.
pub type ChunkReceiver = mpsc::Receiver<Result<String>>;

/// A fully resolved generation request (options already merged with defaults).
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Natural-language prompt built from the transcript.
    pub prompt: String,
    /// Instruction preamble for the engine.
    pub system_prompt: String,
    /// Cap on generated length.
    pub max_output_tokens: u32,
    /// Sampling randomness.
    pub temperature: f32,
}

/// One-time initialization of the expensive shared engine.
#[async_trait]
pub trait EngineLoader: Send + Sync + 'static {
    /// Build the engine, reporting fractional progress in `[0, 1]`.
    ///
    /// # Errors
    /// Returns an error if weights are missing, the backend is unreachable,
    /// or construction fails. The caller treats the failure as retryable.
    async fn load(&self, progress: ProgressFn) -> Result<Arc<dyn DiagramEngine>>;
}

/// Contract for loaded streaming engines.
#[async_trait]
pub trait DiagramEngine: Send + Sync + 'static {
    /// Begin one generation. Increments arrive on the returned channel.
    async fn stream(&self, request: GenerationRequest) -> Result<ChunkReceiver>;

    /// Best-effort interrupt of the active generation, if any. Absence of an
    /// active generation is not an error.
    fn interrupt(&self);

    /// Release backend resources beyond what `Drop` reclaims.
    async fn release(&self) {}
}
