//! Integer source.

use crate::error::Result;
use crate::iterator::{Checkpoint, Dataset, DatasetIterator, IteratorContext};
use crate::model::{Node, NodeBuilder, NodeKind};
use std::sync::Arc;

const NAME: &str = "Range";

/// Yields `start, start + 1, .., end - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    start: i64,
    end: i64,
}

impl Range {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl Dataset for Range {
    type Item = i64;
    type Iter = RangeIterator;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<RangeIterator> {
        let node = ctx.register_node(NodeBuilder::new(NAME, NodeKind::Source))?;
        let prefix = ctx.child(node.clone(), NAME).prefix().to_string();
        Ok(RangeIterator {
            next: self.start,
            end: self.end,
            node,
            prefix,
        })
    }
}

#[derive(Debug)]
pub struct RangeIterator {
    next: i64,
    end: i64,
    node: Arc<Node>,
    prefix: String,
}

impl RangeIterator {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl DatasetIterator for RangeIterator {
    type Item = i64;

    fn get_next(&mut self, ctx: &IteratorContext) -> Result<Option<i64>> {
        self.node.record_start(ctx.now_ns());
        let element = (self.next < self.end).then(|| {
            let value = self.next;
            self.next += 1;
            value
        });
        if element.is_some() {
            self.node.record_element();
            self.node
                .record_bytes_produced(std::mem::size_of::<i64>() as u64);
        }
        self.node.record_stop(ctx.now_ns());
        Ok(element)
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.write(&self.prefix, "next", &self.next)
    }

    fn restore(&mut self, _ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        self.next = checkpoint.read(&self.prefix, "next")?;
        Ok(())
    }
}
