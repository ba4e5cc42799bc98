//! Fills a bounded buffer ahead of the consumer on a background thread.

use super::async_buffer::AsyncBuffer;
use crate::error::Result;
use crate::iterator::{Checkpoint, Dataset, DatasetIterator, ElementSize, IteratorContext};
use crate::model::{Node, NodeBuilder, NodeKind, ParamRef, Parameter, AUTOTUNE, BUFFER_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const NAME: &str = "Prefetch";

/// Upper bound of an autotuned `buffer_size` unless overridden.
pub const DEFAULT_MAX_BUFFER_SIZE: i64 = 256;

/// Autotuned buffers start holding one element.
const INITIAL_BUFFER_SIZE: i64 = 1;

#[derive(Debug, Clone)]
pub struct Prefetch<D> {
    input: D,
    buffer_size: i64,
    max_buffer_size: i64,
}

impl<D: Dataset> Prefetch<D> {
    pub fn new(input: D) -> Self {
        Self {
            input,
            buffer_size: AUTOTUNE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }

    /// Pin the buffer size, or pass [`AUTOTUNE`] to let the model choose.
    pub fn with_buffer_size(mut self, buffer_size: i64) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_max_buffer_size(mut self, max_buffer_size: i64) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    fn parameter(&self) -> Result<ParamRef> {
        let parameter = if self.buffer_size == AUTOTUNE {
            Parameter::new(
                BUFFER_SIZE,
                INITIAL_BUFFER_SIZE,
                0,
                self.max_buffer_size.max(0),
            )?
        } else {
            Parameter::fixed(BUFFER_SIZE, self.buffer_size.max(0))
        };
        Ok(parameter.shared())
    }
}

impl<D> Dataset for Prefetch<D>
where
    D: Dataset,
    D::Item: ElementSize + Serialize + DeserializeOwned,
{
    type Item = D::Item;
    type Iter = PrefetchIterator<D::Iter>;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter> {
        let parameter = self.parameter()?;
        let node = ctx.register_node(
            NodeBuilder::new(NAME, NodeKind::Async(1.0)).parameter(parameter.clone()),
        )?;
        let child = ctx.child(node.clone(), NAME);
        let input = self.input.make_iterator(&child)?;
        let prefix = child.prefix().to_string();
        Ok(PrefetchIterator {
            buffer: AsyncBuffer::new(
                "prefetch",
                node,
                parameter,
                1,
                child,
                input,
                Arc::new(pass_through::<D::Item>),
            ),
            prefix,
        })
    }
}

fn pass_through<T>(element: T) -> Result<T> {
    Ok(element)
}

pub struct PrefetchIterator<I: DatasetIterator> {
    buffer: AsyncBuffer<I, I::Item>,
    prefix: String,
}

impl<I: DatasetIterator> PrefetchIterator<I> {
    pub fn node(&self) -> &Arc<Node> {
        self.buffer.node()
    }
}

impl<I> DatasetIterator for PrefetchIterator<I>
where
    I: DatasetIterator + 'static,
    I::Item: ElementSize + Serialize + DeserializeOwned + Send + 'static,
{
    type Item = I::Item;

    fn get_next(&mut self, _ctx: &IteratorContext) -> Result<Option<I::Item>> {
        self.buffer.get_next()
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.buffer.save(&self.prefix, checkpoint)
    }

    fn restore(&mut self, _ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        self.buffer.restore(&self.prefix, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::parallel_map::ParallelMap;
    use crate::ops::range::Range;
    use std::time::{Duration, Instant};

    #[test]
    fn test_prefetch_yields_input_in_order() {
        let ctx = IteratorContext::default();
        let mut it = Prefetch::new(Range::new(0, 20)).make_iterator(&ctx).unwrap();
        let mut out = Vec::new();
        while let Some(x) = it.get_next(&ctx).unwrap() {
            out.push(x);
        }
        assert_eq!(out, (0..20).collect::<Vec<_>>());
        assert_eq!(it.node().buffered_elements(), 0);
    }

    #[test]
    fn test_autotuned_buffer_size_range() {
        let ctx = IteratorContext::default();
        let it = Prefetch::new(Range::new(0, 1))
            .with_max_buffer_size(64)
            .make_iterator(&ctx)
            .unwrap();
        let parameter = it.node().parameter(BUFFER_SIZE).unwrap();
        assert!(parameter.is_tunable());
        assert_eq!(parameter.load(), 1);
        assert_eq!(parameter.min(), 0);
        assert_eq!(parameter.max(), 64);
    }

    #[test]
    fn test_buffer_fills_ahead_of_consumer() {
        let ctx = IteratorContext::default();
        let mut it = Prefetch::new(Range::new(0, 100))
            .with_buffer_size(8)
            .make_iterator(&ctx)
            .unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(0));

        let deadline = Instant::now() + Duration::from_secs(5);
        while it.node().buffered_elements() < 8 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(it.node().buffered_elements(), 8);
        assert_eq!(it.node().buffered_bytes(), 64);
    }

    #[test]
    fn test_buffered_element_is_served_while_input_is_slow() {
        const COST: Duration = Duration::from_millis(200);
        let ctx = IteratorContext::default();
        let slow = ParallelMap::new(Range::new(0, 20), |x| {
            std::thread::sleep(COST);
            Ok(x)
        })
        .with_parallelism(1);
        let mut it = Prefetch::new(slow)
            .with_buffer_size(4)
            .make_iterator(&ctx)
            .unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(0));

        let deadline = Instant::now() + Duration::from_secs(5);
        while it.node().buffered_elements() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(it.node().buffered_elements() >= 2);
        // The prefetch worker is now blocked inside the next slow pull.
        std::thread::sleep(Duration::from_millis(20));

        for expected in [1, 2] {
            let call = Instant::now();
            assert_eq!(it.get_next(&ctx).unwrap(), Some(expected));
            assert!(
                call.elapsed() < COST / 4,
                "waited {:?} for a buffered element",
                call.elapsed()
            );
        }
    }

    #[test]
    fn test_zero_buffer_size_still_serves() {
        let ctx = IteratorContext::default();
        let mut it = Prefetch::new(Range::new(0, 3))
            .with_buffer_size(0)
            .make_iterator(&ctx)
            .unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(0));
        assert_eq!(it.get_next(&ctx).unwrap(), Some(1));
        assert_eq!(it.get_next(&ctx).unwrap(), Some(2));
        assert_eq!(it.get_next(&ctx).unwrap(), None);
    }

    #[test]
    fn test_prefetch_checkpoint_keeps_buffered_elements() {
        let ctx = IteratorContext::default();
        let mut it = Prefetch::new(Range::new(0, 10))
            .with_buffer_size(4)
            .make_iterator(&ctx)
            .unwrap();
        it.get_next(&ctx).unwrap();
        it.get_next(&ctx).unwrap();
        let mut checkpoint = Checkpoint::new();
        it.save(&mut checkpoint).unwrap();
        assert!(checkpoint.contains("Prefetch", "buffer"));
        assert!(checkpoint.contains("Prefetch::Range", "next"));

        let mut other = Prefetch::new(Range::new(0, 10))
            .with_buffer_size(4)
            .make_iterator(&ctx)
            .unwrap();
        other.restore(&ctx, &checkpoint).unwrap();
        let mut rest = Vec::new();
        while let Some(x) = other.get_next(&ctx).unwrap() {
            rest.push(x);
        }
        assert_eq!(rest, (2..10).collect::<Vec<_>>());
    }
}
