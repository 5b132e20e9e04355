//! Atlas library crate
//!
//! Incremental repository analysis: a file-change cache decides which
//! agents must rerun, a content-addressed response cache deduplicates model
//! calls, and a bounded worker pool runs the agents that are due.

pub mod agents;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod pool;
pub mod scan;
pub mod util;

pub use error::{CacheError, InvokeError, RunError, ScanError, TaskError};
pub use orchestrator::{Orchestrator, RunContext, RunReport, RunVerdict};
