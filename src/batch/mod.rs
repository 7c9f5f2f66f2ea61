//! Batch Orchestrator: resumable, cancellable embedding runs.
//!
//! - At most one run per index (in-process registry plus `embed.lock`)
//! - Starting returns at once; callers poll the persisted [`BatchProgress`]
//! - Cancellation is cooperative and checked between batches

pub mod progress;
pub mod registry;
pub mod runner;

pub use progress::{BatchProgress, BatchStatus, CancelToken};
pub use registry::RunRegistry;
pub use runner::EmbedOptions;
