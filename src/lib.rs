//! # Pipeline Autotune: Runtime Tuning for Streaming Input Pipelines
//!
//! A library of composable pipeline operators whose parallelism and buffer
//! sizes are chosen at runtime. Wrapping a pipeline with
//! [`DatasetExt::autotune`] builds a performance model of the nested
//! operators and starts a background controller that periodically searches
//! for parameter values minimizing the estimated time per output element,
//! within a CPU budget and a RAM budget.
//!
//! ## Architecture
//!
//! - **Model**: A tree of nodes, one per operator, holding relaxed atomic
//!   statistics and the shared tunable parameters
//! - **Optimizer**: Hill climbing or projected gradient descent over a
//!   snapshot of the model, committed under a short write lock
//! - **Controller**: One `autotune-model` thread per iterator, running on a
//!   doubling period
//! - **Operators**: Sources, batching and worker-pool operators built on a
//!   `crossbeam-channel` engine
//!
//! ## Configuration
//!
//! Budgets and optimizer constants can be read from a TOML file in the
//! platform config directory under `pipeline-autotune`, and overridden with
//! `AUTOTUNE_*` environment variables. See [`config`].
//!
//! ## Example
//!
//! ```no_run
//! use pipeline_autotune::prelude::*;
//!
//! fn main() -> pipeline_autotune::Result<()> {
//!     let dataset = Range::new(0, 10_000)
//!         .parallel_map(|x| Ok(x * x))
//!         .batch(64)
//!         .prefetch()
//!         .autotune(AutotuneOptions::new().with_cpu_budget(4))?;
//!
//!     let ctx = IteratorContext::default();
//!     let mut it = dataset.make_iterator(&ctx)?;
//!     while let Some(batch) = it.get_next(&ctx)? {
//!         println!("{} elements", batch.len());
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod autotune;
pub mod config;
pub mod error;
pub mod host;
pub mod iterator;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod ops;

// Re-export commonly used types
pub use autotune::{AutotuneOptions, ModelDataset, ModelIterator};
pub use config::{AutotuneAlgorithm, AutotuneConfig, OptimizerSettings};
pub use error::{AutotuneError, Result, ResultExt};
pub use iterator::{Checkpoint, Dataset, DatasetIterator, IteratorContext};
pub use model::{Model, AUTOTUNE};
pub use ops::DatasetExt;

/// Everything needed to build and drive a tuned pipeline.
pub mod prelude {
    pub use crate::autotune::{AutotuneOptions, ModelDataset};
    pub use crate::config::AutotuneAlgorithm;
    pub use crate::iterator::{Checkpoint, Dataset, DatasetIterator, IteratorContext};
    pub use crate::model::AUTOTUNE;
    pub use crate::ops::{Batch, DatasetExt, ParallelMap, Prefetch, Range};
}
