//! Mnemograph: an entity summarization and pattern mining pipeline.
//!
//! Raw memory and code entities arrive on durable queues, get summarized into
//! embedding-bearing `EntitySummary` nodes, and a background detector mines
//! the summary corpus for recurring behavioral patterns (debugging sessions,
//! research phases, refactoring work, intensive sessions, memory-code links).
//! Correctness under concurrency comes from storage-level uniqueness
//! constraints and idempotent merges, not from locks.

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod maintenance;
pub mod patterns;
pub mod queue;
pub mod summarizer;

pub use config::Config;
pub use error::{PipelineError, Result};
