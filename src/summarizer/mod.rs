//! Entity summarization: signal classification plus the queue-driven worker.

pub mod signals;
pub mod worker;

pub use worker::{shutdown_requested, BatchOutcome, Summarizer, SummarizerWorker};
