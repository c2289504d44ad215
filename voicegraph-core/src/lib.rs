//! # voicegraph-core
//!
//! Continuous voice-fed diagram regeneration SDK.
//!
//! ## Architecture
//!
//! ```text
//! TranscriptSource → TriggerScheduler ──spawn──► GenerateFn
//!                        │                          │
//!                  staleness check            ResourceManager
//!                        │                          │
//!                   OnSettled ◄── result     DiagramEngine (streamed)
//! ```
//!
//! The scheduler decides *when* to regenerate from a mutating transcript;
//! the resource manager owns the single shared streaming engine and decides
//! *which* overlapping attempt's output is allowed through. Both lean on the
//! same staleness rule: a monotonic sequence number invalidates any async
//! result that arrives after a newer attempt has superseded it.
//!
//! The scheduler has no dependency on the resource manager — wire any
//! `GenerateFn` into it. Rendering, speech capture, and persistence stay
//! outside this crate behind the injected contracts.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod resource;
pub mod scheduler;
pub mod sequence;

// Convenience re-exports for downstream crates
pub use engine::{DiagramEngine, EngineLoader, GenerationRequest, StubEngine, StubLoader};
pub use error::{Result, VoicegraphError};
pub use resource::{
    GenerationOptions, ResourceConfig, ResourceManager, ResourceSnapshot, ResourceStatus,
};
pub use scheduler::{
    GenerateFn, SchedulerConfig, SchedulerSnapshot, SettleFn, TranscriptSource, TriggerScheduler,
    TriggerTask,
};
