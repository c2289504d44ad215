//! `StubEngine` — placeholder backend that sketches a diagram without real
//! inference.
//!
//! Produces a deterministic flowchart from the request prompt so the full
//! scheduler → manager → canvas pipeline can be exercised end-to-end before
//! a real model backend is wired in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChunkReceiver, DiagramEngine, EngineLoader, GenerationRequest, ProgressFn};
use crate::error::Result;

/// How many words of the prompt become flowchart nodes.
const MAX_STUB_NODES: usize = 6;

/// Loader that "initializes" over a short, configurable delay, reporting
/// progress in quarters.
pub struct StubLoader {
    load_delay: Duration,
}

impl StubLoader {
    pub fn new(load_delay: Duration) -> Self {
        Self { load_delay }
    }
}

impl Default for StubLoader {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

#[async_trait]
impl EngineLoader for StubLoader {
    async fn load(&self, progress: ProgressFn) -> Result<Arc<dyn DiagramEngine>> {
        let steps = 4u32;
        for step in 1..=steps {
            tokio::time::sleep(self.load_delay / steps).await;
            progress(step as f32 / steps as f32);
        }
        debug!("StubLoader ready");
        Ok(Arc::new(StubEngine::new(Duration::from_millis(10))))
    }
}

/// Echo-style stub engine.
///
/// Streams a `flowchart TD` whose nodes are the leading words of the prompt,
/// one line per chunk. `interrupt` flips a flag the producer task polls
/// between chunks.
pub struct StubEngine {
    chunk_delay: Duration,
    interrupted: Arc<AtomicBool>,
}

impl StubEngine {
    pub fn new(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn render_lines(request: &GenerationRequest) -> Vec<String> {
        let nodes: Vec<&str> = request
            .prompt
            .split_whitespace()
            .filter(|w| w.chars().any(char::is_alphanumeric))
            .take(MAX_STUB_NODES)
            .collect();

        let mut lines = vec!["flowchart TD".to_string()];
        if nodes.is_empty() {
            lines.push("    n0[empty]".to_string());
            return lines;
        }
        for (i, word) in nodes.iter().enumerate() {
            let label: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            lines.push(format!("    n{i}[{label}]"));
        }
        for i in 1..nodes.len() {
            lines.push(format!("    n{} --> n{}", i - 1, i));
        }
        lines
    }
}

#[async_trait]
impl DiagramEngine for StubEngine {
    async fn stream(&self, request: GenerationRequest) -> Result<ChunkReceiver> {
        self.interrupted.store(false, Ordering::SeqCst);
        let lines = Self::render_lines(&request);
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        let delay = self.chunk_delay;
        let interrupted = Arc::clone(&self.interrupted);

        tokio::spawn(async move {
            for (i, line) in lines.iter().enumerate() {
                if interrupted.load(Ordering::SeqCst) {
                    debug!(chunks_sent = i, "stub stream interrupted");
                    return;
                }
                tokio::time::sleep(delay).await;
                let chunk = if i == 0 {
                    line.clone()
                } else {
                    format!("\n{line}")
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}
