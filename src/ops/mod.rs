//! Pipeline operators
//!
//! Each operator is a [`Dataset`] that registers one node with the model
//! (when one is attached to the context) and exposes its knobs as shared
//! parameters. The asynchronous operators are thin wrappers around a common
//! worker engine.
//!
//! # Main Types
//!
//! - [`Range`] - Integer source
//! - [`Batch`] - Fixed-size grouping (`KnownRatio`)
//! - [`ParallelMap`] - Order-preserving map on a worker pool, tunable `parallelism`
//! - [`Prefetch`] - Read-ahead buffer, tunable `buffer_size`
//! - [`DatasetExt`] - Chaining combinators for all of the above

pub(crate) mod async_buffer;
pub mod batch;
pub mod parallel_map;
pub mod prefetch;
pub mod range;

pub use async_buffer::Transform;
pub use batch::{Batch, BatchIterator};
pub use parallel_map::{ParallelMap, ParallelMapIterator};
pub use prefetch::{Prefetch, PrefetchIterator, DEFAULT_MAX_BUFFER_SIZE};
pub use range::{Range, RangeIterator};

use crate::autotune::{AutotuneOptions, ModelDataset};
use crate::error::Result;
use crate::iterator::Dataset;

/// Builder-style combinators available on every dataset.
///
/// ```no_run
/// use pipeline_autotune::prelude::*;
///
/// let dataset = Range::new(0, 1_000)
///     .parallel_map(|x| Ok(x * 2))
///     .batch(32)
///     .prefetch()
///     .autotune(AutotuneOptions::default())?;
/// # Ok::<(), pipeline_autotune::AutotuneError>(())
/// ```
pub trait DatasetExt: Dataset + Sized {
    fn batch(self, batch_size: usize) -> Batch<Self> {
        Batch::new(self, batch_size)
    }

    fn parallel_map<U, F>(self, f: F) -> ParallelMap<Self, U>
    where
        F: Fn(Self::Item) -> Result<U> + Send + Sync + 'static,
    {
        ParallelMap::new(self, f)
    }

    fn prefetch(self) -> Prefetch<Self> {
        Prefetch::new(self)
    }

    /// Wrap the pipeline so that its parameters are tuned while it runs.
    fn autotune(self, options: AutotuneOptions) -> Result<ModelDataset<Self>> {
        ModelDataset::new(self, options)
    }
}

impl<D: Dataset + Sized> DatasetExt for D {}
