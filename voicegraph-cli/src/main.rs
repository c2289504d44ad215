//! Voicegraph terminal host.
//!
//! Reads a growing "transcript" from stdin (each line extends it), lets the
//! trigger scheduler decide when to regenerate, and prints every accepted
//! diagram to stdout. Stand-in for a real canvas + speech-capture frontend:
//! the wiring between scheduler, resource manager, prompt builder, and
//! canvas insertion is exactly what a GUI host would do.
//!
//! Logs go to stderr so stdout stays clean diagram output. Try:
//!
//! ```text
//! RUST_LOG=voicegraph_core=debug cargo run -p voicegraph-cli
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use voicegraph_core::scheduler::{GenerateFn, SettleFn, TranscriptSource};
use voicegraph_core::{
    GenerationOptions, ResourceConfig, ResourceManager, SchedulerConfig, StubLoader,
    TriggerScheduler,
};

#[derive(Debug, Parser)]
#[command(name = "voicegraph", about = "Voice-fed diagram regeneration, in a terminal")]
struct Args {
    /// Minimum delay between scheduler ticks (ms)
    #[arg(long, default_value_t = 1_000)]
    interval_baseline_ms: u64,

    /// Hard ceiling on the tick delay (ms)
    #[arg(long, default_value_t = 8_000)]
    max_interval_ms: u64,

    /// Trimmed transcript length below which no generation fires
    #[arg(long, default_value_t = 10)]
    min_transcript_length: usize,

    /// Wall-clock budget per generation (ms)
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Simulated engine load time (ms)
    #[arg(long, default_value_t = 200)]
    load_delay_ms: u64,

    /// Print final scheduler/resource snapshots as JSON on exit
    #[arg(long)]
    json: bool,
}

fn build_prompt(transcript: &str) -> String {
    format!("Sketch a diagram of: {}", transcript.trim())
}

/// The canvas collaborator: "insertion" here is printing to stdout.
async fn insert_into_canvas(diagram: String) {
    println!("──── diagram ────");
    println!("{diagram}");
    println!("─────────────────");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let manager = Arc::new(ResourceManager::new(
        Arc::new(StubLoader::new(Duration::from_millis(args.load_delay_ms))),
        ResourceConfig {
            default_timeout_ms: args.timeout_ms,
            ..Default::default()
        },
    ));

    // Surface resource state transitions while we run.
    {
        let mut snapshots = manager.subscribe();
        tokio::spawn(async move {
            let mut last = None;
            while let Ok(snap) = snapshots.recv().await {
                if last != Some(snap.status) {
                    info!(status = ?snap.status, progress = snap.load_progress, "resource");
                    last = Some(snap.status);
                }
            }
        });
    }

    let generate: GenerateFn = {
        let manager = Arc::clone(&manager);
        Arc::new(move |task| {
            let manager = Arc::clone(&manager);
            async move {
                let prompt = build_prompt(&task.transcript);
                match manager.generate(&prompt, &GenerationOptions::default()).await {
                    Ok(text) => Ok(Some(text)),
                    Err(e) if e.is_cancellation() => {
                        debug!(task_id = task.id, "attempt superseded");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            .boxed()
        })
    };

    let on_settled: SettleFn = Arc::new(|result, task| match result {
        Some(diagram) => {
            info!(task_id = task.id, chars = diagram.len(), "diagram accepted");
            tokio::spawn(insert_into_canvas(diagram.to_string()));
        }
        None => debug!(task_id = task.id, "attempt settled without output"),
    });

    let scheduler = TriggerScheduler::new(
        SchedulerConfig {
            interval_baseline_ms: args.interval_baseline_ms,
            max_interval_ms: args.max_interval_ms,
            min_transcript_length: args.min_transcript_length,
            ..Default::default()
        },
        generate,
        on_settled,
    );

    let transcript = Arc::new(Mutex::new(String::new()));
    let source: TranscriptSource = {
        let transcript = Arc::clone(&transcript);
        Arc::new(move || transcript.lock().clone())
    };

    scheduler.start(source);
    info!("speak by typing — every line extends the transcript (ctrl-d to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let mut t = transcript.lock();
                    if !t.is_empty() {
                        t.push(' ');
                    }
                    t.push_str(line.trim());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&scheduler.snapshot())?);
        println!("{}", serde_json::to_string_pretty(&manager.snapshot())?);
    }

    scheduler.stop();
    manager.unload().await;
    info!("bye");
    Ok(())
}
