//! Iterator contract shared by operators and the autotune facade
//!
//! A [`Dataset`] is a reusable description of a pipeline stage; calling
//! [`Dataset::make_iterator`] instantiates a [`DatasetIterator`] that
//! produces elements. Iterators are created top-down: each stage registers
//! its node through the [`IteratorContext`] it was given, then builds its
//! input with a child context whose parent is that node. This is how a
//! [`Model`] installed by the facade reaches every nested operator.
//!
//! # Main Types
//!
//! - [`Dataset`] / [`DatasetIterator`] - Factory and producer
//! - [`IteratorContext`] - Clock, model, parent node and checkpoint prefix
//! - [`Checkpoint`] - Flat key/value store for save and restore
//! - [`ElementSize`] - Byte estimate used for buffer accounting

pub mod checkpoint;

pub use checkpoint::Checkpoint;

use crate::error::Result;
use crate::host::{ClockRef, MonotonicClock};
use crate::model::{Model, Node, NodeBuilder};
use std::fmt;
use std::sync::Arc;

/// Factory of iterators over a sequence of elements.
pub trait Dataset: Send + Sync {
    type Item: Send + 'static;
    type Iter: DatasetIterator<Item = Self::Item> + 'static;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    type Item = D::Item;
    type Iter = D::Iter;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter> {
        (**self).make_iterator(ctx)
    }
}

/// Producer of elements.
pub trait DatasetIterator: Send {
    type Item;

    /// Next element, or `Ok(None)` at end of sequence.
    fn get_next(&mut self, ctx: &IteratorContext) -> Result<Option<Self::Item>>;

    /// Write this iterator's position (and its inputs') into `checkpoint`.
    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()>;

    /// Resume from a position written by [`DatasetIterator::save`].
    fn restore(&mut self, ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()>;
}

impl<T> DatasetIterator for Box<dyn DatasetIterator<Item = T>> {
    type Item = T;

    fn get_next(&mut self, ctx: &IteratorContext) -> Result<Option<T>> {
        (**self).get_next(ctx)
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        (**self).save(checkpoint)
    }

    fn restore(&mut self, ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        (**self).restore(ctx, checkpoint)
    }
}

/// Environment an iterator is created and driven in.
#[derive(Clone)]
pub struct IteratorContext {
    clock: ClockRef,
    model: Option<Arc<Model>>,
    parent: Option<Arc<Node>>,
    prefix: String,
}

impl IteratorContext {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            model: None,
            parent: None,
            prefix: String::new(),
        }
    }

    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        self.model.as_ref()
    }

    pub fn parent(&self) -> Option<&Arc<Node>> {
        self.parent.as_ref()
    }

    /// Checkpoint prefix of the iterator created with this context.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Copy with `model` attached and `root` as the parent of the next node.
    pub fn with_model(&self, model: Arc<Model>, root: Arc<Node>) -> Self {
        Self {
            model: Some(model),
            parent: Some(root),
            ..self.clone()
        }
    }

    /// Copy for building an input of `parent`, nesting the prefix under `name`.
    pub fn child(&self, parent: Arc<Node>, name: &str) -> Self {
        let prefix = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", self.prefix, name)
        };
        Self {
            parent: Some(parent),
            prefix,
            ..self.clone()
        }
    }

    /// Create the node for an operator being instantiated.
    ///
    /// With a model attached the node joins the model's tree under the
    /// current parent; without one it is detached and never tuned.
    pub fn register_node(&self, builder: NodeBuilder) -> Result<Arc<Node>> {
        match &self.model {
            Some(model) => model.add_node(self.parent.as_ref(), builder),
            None => Node::detached(builder),
        }
    }
}

impl Default for IteratorContext {
    fn default() -> Self {
        Self::new(MonotonicClock::shared())
    }
}

impl fmt::Debug for IteratorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IteratorContext")
            .field("model", &self.model.is_some())
            .field("parent", &self.parent.as_ref().map(|p| p.long_name()))
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Approximate heap and inline size of an element, in bytes.
pub trait ElementSize {
    fn element_size(&self) -> u64;
}

macro_rules! impl_element_size_for_primitives {
    ($($t:ty),*) => {
        $(
            impl ElementSize for $t {
                fn element_size(&self) -> u64 {
                    std::mem::size_of::<$t>() as u64
                }
            }
        )*
    };
}

impl_element_size_for_primitives!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

impl ElementSize for String {
    fn element_size(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: ElementSize> ElementSize for Vec<T> {
    fn element_size(&self) -> u64 {
        self.iter().map(ElementSize::element_size).sum()
    }
}

impl<T: ElementSize> ElementSize for Option<T> {
    fn element_size(&self) -> u64 {
        self.as_ref().map_or(0, ElementSize::element_size)
    }
}

impl<A: ElementSize, B: ElementSize> ElementSize for (A, B) {
    fn element_size(&self) -> u64 {
        self.0.element_size() + self.1.element_size()
    }
}
