//! # Conductor
//!
//! An agent execution engine: supervise external coding-assistant processes
//! (Claude CLI, ACP agents like Gemini CLI, GitHub Copilot CLI), normalize
//! their three wire protocols into one event stream, schedule them under a
//! concurrency cap with retries and per-task-type circuit breakers, and
//! chain them into linear workflows.
//!
//! ## Modules
//!
//! - `process` - Child process supervision: spawn, streams, slots, signals
//! - `events` - Normalized event model shared by every agent protocol
//! - `normalize` - Chunk coalescing, tool-call lifecycle, plan rendering
//! - `acp` - Bidirectional JSON-RPC client over NDJSON stdio
//! - `agents` - Adapters, executors, and the global agent registry
//! - `sessions` - Append-only per-session jsonl logs with fork and resume
//! - `engine` - Bounded-concurrency scheduling with dependencies and retries
//! - `resilience` - Retry policies and circuit breakers over the engine
//! - `workflow` - Linear multi-step orchestration with cleanup hooks
//! - `testing` - Scripted mock runner for driving the engine in tests

pub mod acp;
pub mod agents;
pub mod engine;
pub mod error;
pub mod events;
pub mod normalize;
pub mod process;
pub mod resilience;
pub mod sessions;
pub mod testing;
pub mod workflow;

pub use error::{Error, Result};

/// Initialize tracing from `RUST_LOG`, defaulting to `info`. Embedders that
/// bring their own subscriber skip this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
