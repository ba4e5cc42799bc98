//! Applies a function to every element on a pool of worker threads.

use super::async_buffer::{AsyncBuffer, Transform};
use crate::error::Result;
use crate::host::{ResourceProbe, SystemResources};
use crate::iterator::{Checkpoint, Dataset, DatasetIterator, ElementSize, IteratorContext};
use crate::model::{Node, NodeBuilder, NodeKind, ParamRef, Parameter, AUTOTUNE, PARALLELISM};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const NAME: &str = "ParallelMap";

/// Parallel, order-preserving map.
///
/// With the default [`AUTOTUNE`] parallelism the operator exposes a
/// tunable `parallelism` in `[1, max_parallelism]`, starting at 1. A fixed
/// parallelism is reported to the model but never changed.
pub struct ParallelMap<D: Dataset, U> {
    input: D,
    transform: Transform<D::Item, U>,
    parallelism: i64,
    max_parallelism: Option<i64>,
}

impl<D: Dataset + std::fmt::Debug, U> std::fmt::Debug for ParallelMap<D, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelMap")
            .field("input", &self.input)
            .field("parallelism", &self.parallelism)
            .field("max_parallelism", &self.max_parallelism)
            .finish_non_exhaustive()
    }
}

impl<D: Dataset, U> ParallelMap<D, U> {
    pub fn new<F>(input: D, f: F) -> Self
    where
        F: Fn(D::Item) -> Result<U> + Send + Sync + 'static,
    {
        Self {
            input,
            transform: Arc::new(f),
            parallelism: AUTOTUNE,
            max_parallelism: None,
        }
    }

    /// Pin the parallelism, or pass [`AUTOTUNE`] to let the model choose.
    pub fn with_parallelism(mut self, parallelism: i64) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Upper bound of the tunable range; defaults to the schedulable CPU count.
    pub fn with_max_parallelism(mut self, max_parallelism: i64) -> Self {
        self.max_parallelism = Some(max_parallelism);
        self
    }

    fn parameter(&self) -> Result<ParamRef> {
        let parameter = if self.parallelism == AUTOTUNE {
            let max = self
                .max_parallelism
                .unwrap_or_else(|| SystemResources.schedulable_cpus())
                .max(1);
            Parameter::new(PARALLELISM, AUTOTUNE, 1, max)?
        } else {
            Parameter::fixed(PARALLELISM, self.parallelism.max(1))
        };
        Ok(parameter.shared())
    }
}

impl<D, U> Dataset for ParallelMap<D, U>
where
    D: Dataset,
    U: ElementSize + Serialize + DeserializeOwned + Send + 'static,
{
    type Item = U;
    type Iter = ParallelMapIterator<D::Iter, U>;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter> {
        let parameter = self.parameter()?;
        let node = ctx.register_node(
            NodeBuilder::new(NAME, NodeKind::Async(1.0)).parameter(parameter.clone()),
        )?;
        let child = ctx.child(node.clone(), NAME);
        let input = self.input.make_iterator(&child)?;
        let prefix = child.prefix().to_string();
        let max_workers = parameter.max() as usize;
        Ok(ParallelMapIterator {
            buffer: AsyncBuffer::new(
                "parallel-map",
                node,
                parameter,
                max_workers,
                child,
                input,
                self.transform.clone(),
            ),
            prefix,
        })
    }
}

pub struct ParallelMapIterator<I: DatasetIterator, U> {
    buffer: AsyncBuffer<I, U>,
    prefix: String,
}

impl<I: DatasetIterator, U> ParallelMapIterator<I, U> {
    pub fn node(&self) -> &Arc<Node> {
        self.buffer.node()
    }

    /// Worker threads started so far.
    pub fn num_workers(&self) -> usize {
        self.buffer.num_workers()
    }
}

impl<I, U> DatasetIterator for ParallelMapIterator<I, U>
where
    I: DatasetIterator + 'static,
    I::Item: Send + 'static,
    U: ElementSize + Serialize + DeserializeOwned + Send + 'static,
{
    type Item = U;

    fn get_next(&mut self, _ctx: &IteratorContext) -> Result<Option<U>> {
        self.buffer.get_next()
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.buffer.save(&self.prefix, checkpoint)
    }

    fn restore(&mut self, _ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        self.buffer.restore(&self.prefix, checkpoint)
    }
}
