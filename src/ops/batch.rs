//! Groups consecutive elements into vectors.

use crate::error::{AutotuneError, Result};
use crate::iterator::{Checkpoint, Dataset, DatasetIterator, ElementSize, IteratorContext};
use crate::model::{Node, NodeBuilder, NodeKind};
use std::sync::Arc;

const NAME: &str = "Batch";

/// Emits `Vec`s of `batch_size` input elements.
///
/// The last batch may be short unless `drop_remainder` is set.
#[derive(Debug, Clone)]
pub struct Batch<D> {
    input: D,
    batch_size: usize,
    drop_remainder: bool,
}

impl<D: Dataset> Batch<D> {
    pub fn new(input: D, batch_size: usize) -> Self {
        Self {
            input,
            batch_size,
            drop_remainder: false,
        }
    }

    pub fn with_drop_remainder(mut self, drop_remainder: bool) -> Self {
        self.drop_remainder = drop_remainder;
        self
    }
}

impl<D> Dataset for Batch<D>
where
    D: Dataset,
    D::Item: ElementSize,
{
    type Item = Vec<D::Item>;
    type Iter = BatchIterator<D::Iter>;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter> {
        if self.batch_size == 0 {
            return Err(AutotuneError::Configuration(
                "batch size must be positive".to_string(),
            ));
        }
        let node = ctx.register_node(NodeBuilder::new(
            NAME,
            NodeKind::KnownRatio(self.batch_size as f64),
        ))?;
        let child = ctx.child(node.clone(), NAME);
        let input = self.input.make_iterator(&child)?;
        Ok(BatchIterator {
            input,
            batch_size: self.batch_size,
            drop_remainder: self.drop_remainder,
            end_of_input: false,
            node,
            ctx: child,
        })
    }
}

pub struct BatchIterator<I> {
    input: I,
    batch_size: usize,
    drop_remainder: bool,
    end_of_input: bool,
    node: Arc<Node>,
    ctx: IteratorContext,
}

impl<I> DatasetIterator for BatchIterator<I>
where
    I: DatasetIterator,
    I::Item: ElementSize,
{
    type Item = Vec<I::Item>;

    fn get_next(&mut self, ctx: &IteratorContext) -> Result<Option<Self::Item>> {
        if self.end_of_input {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        self.node.record_start(ctx.now_ns());
        while batch.len() < self.batch_size {
            // Time spent in the input belongs to the input's node.
            self.node.record_stop(ctx.now_ns());
            let next = self.input.get_next(&self.ctx);
            self.node.record_start(ctx.now_ns());
            match next {
                Ok(Some(element)) => batch.push(element),
                Ok(None) => {
                    self.end_of_input = true;
                    break;
                }
                Err(e) => {
                    self.node.record_stop(ctx.now_ns());
                    return Err(e);
                }
            }
        }
        self.node.record_stop(ctx.now_ns());

        if batch.is_empty() || (self.drop_remainder && batch.len() < self.batch_size) {
            return Ok(None);
        }
        let size = batch.element_size();
        self.node.record_bytes_consumed(size);
        self.node.record_bytes_produced(size);
        self.node.record_element();
        Ok(Some(batch))
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.input.save(checkpoint)?;
        checkpoint.write(self.ctx.prefix(), "end_of_input", &self.end_of_input)
    }

    fn restore(&mut self, _ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        self.input.restore(&self.ctx, checkpoint)?;
        self.end_of_input = checkpoint.read(self.ctx.prefix(), "end_of_input")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::range::Range;

    #[test]
    fn test_batches_with_partial_tail() {
        let ctx = IteratorContext::default();
        let mut it = Batch::new(Range::new(0, 7), 3).make_iterator(&ctx).unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(vec![0, 1, 2]));
        assert_eq!(it.get_next(&ctx).unwrap(), Some(vec![3, 4, 5]));
        assert_eq!(it.get_next(&ctx).unwrap(), Some(vec![6]));
        assert_eq!(it.get_next(&ctx).unwrap(), None);
    }

    #[test]
    fn test_drop_remainder() {
        let ctx = IteratorContext::default();
        let mut it = Batch::new(Range::new(0, 7), 3)
            .with_drop_remainder(true)
            .make_iterator(&ctx)
            .unwrap();
        assert!(it.get_next(&ctx).unwrap().is_some());
        assert!(it.get_next(&ctx).unwrap().is_some());
        assert_eq!(it.get_next(&ctx).unwrap(), None);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let ctx = IteratorContext::default();
        let err = Batch::new(Range::new(0, 7), 0).make_iterator(&ctx).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_batch_checkpoint_round_trip() {
        let ctx = IteratorContext::default();
        let mut it = Batch::new(Range::new(0, 10), 4).make_iterator(&ctx).unwrap();
        it.get_next(&ctx).unwrap();
        let mut checkpoint = Checkpoint::new();
        it.save(&mut checkpoint).unwrap();
        assert!(checkpoint.contains("Batch::Range", "next"));

        let mut other = Batch::new(Range::new(0, 10), 4).make_iterator(&ctx).unwrap();
        other.restore(&ctx, &checkpoint).unwrap();
        assert_eq!(other.get_next(&ctx).unwrap(), Some(vec![4, 5, 6, 7]));
    }
}
