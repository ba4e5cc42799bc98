//! The autotuning wrapper around a pipeline.
//!
//! [`ModelDataset`] is transparent to its consumer: it yields exactly what
//! its input yields and forwards errors unchanged. Underneath, creating an
//! iterator builds a fresh [`Model`] that every nested operator registers
//! with, and pulling from the iterator drives a [`Controller`] that tunes
//! those operators while the pipeline runs.

use super::controller::{Controller, ControllerState};
use super::options::AutotuneOptions;
use crate::error::Result;
use crate::host::{self, Budgets, SystemResources};
use crate::iterator::{Checkpoint, Dataset, DatasetIterator, IteratorContext};
use crate::model::{Model, Node, NodeBuilder, NodeKind};
use std::sync::Arc;

const NAME: &str = "Model";

/// A dataset whose iterators tune their own pipeline.
#[derive(Debug)]
pub struct ModelDataset<D> {
    input: D,
    options: AutotuneOptions,
}

impl<D: Dataset> ModelDataset<D> {
    /// Fails with a configuration error if a budget is negative or the
    /// optimizer settings are unusable. No thread is started here.
    pub fn new(input: D, options: AutotuneOptions) -> Result<Self> {
        host::validate_requested(options.cpu_budget, options.ram_budget)?;
        options.optimizer.validate()?;
        Ok(Self { input, options })
    }

    pub fn options(&self) -> &AutotuneOptions {
        &self.options
    }
}

impl<D: Dataset> Dataset for ModelDataset<D> {
    type Item = D::Item;
    type Iter = ModelIterator<D::Iter>;

    fn make_iterator(&self, ctx: &IteratorContext) -> Result<Self::Iter> {
        let probe = self
            .options
            .probe
            .clone()
            .unwrap_or_else(SystemResources::shared);
        let budgets = Budgets::resolve(
            self.options.cpu_budget,
            self.options.ram_budget,
            probe.as_ref(),
            self.options.optimizer.ram_budget_share,
        )?;

        let mut model = Model::new(self.options.optimizer.clone());
        if let Some(sink) = &self.options.sink {
            model = model.with_sink(sink.clone());
        }
        let model = Arc::new(model);
        let root = model.add_node(None, NodeBuilder::new(NAME, NodeKind::KnownRatio(1.0)))?;

        let child = ctx
            .with_model(model.clone(), root.clone())
            .child(root.clone(), NAME);
        let input = self.input.make_iterator(&child)?;

        let controller = Controller::new(
            model.clone(),
            self.options.algorithm,
            budgets,
            ctx.clock().clone(),
        );
        tracing::debug!(
            "Created autotuned iterator with {} nodes, {:?}",
            model.num_nodes(),
            budgets
        );

        Ok(ModelIterator {
            controller,
            input,
            model,
            root,
            budgets,
            ctx: child,
        })
    }
}

/// Iterator created by [`ModelDataset`].
pub struct ModelIterator<I> {
    // Declared first so the controller stops before the pipeline is torn down.
    controller: Controller,
    input: I,
    model: Arc<Model>,
    root: Arc<Node>,
    budgets: Budgets,
    ctx: IteratorContext,
}

impl<I> ModelIterator<I> {
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The facade's own node, root of the model tree.
    pub fn node(&self) -> &Arc<Node> {
        &self.root
    }

    /// Budgets resolved when the iterator was created.
    pub fn budgets(&self) -> Budgets {
        self.budgets
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn resume(&self) {
        self.controller.resume();
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller.state()
    }

    /// Mean gap between consumer requests, in nanoseconds.
    pub fn self_input_time_ns(&self) -> u64 {
        self.controller.self_input_time_ns()
    }

    pub fn num_input_events(&self) -> u64 {
        self.controller.num_input_events()
    }

    /// Completed optimization cycles.
    pub fn optimization_cycles(&self) -> u64 {
        self.controller.cycles()
    }
}

impl<I: DatasetIterator> DatasetIterator for ModelIterator<I> {
    type Item = I::Item;

    fn get_next(&mut self, _ctx: &IteratorContext) -> Result<Option<I::Item>> {
        self.controller.begin_request()?;
        let result = self.input.get_next(&self.ctx);
        self.controller.end_request();

        if let Ok(Some(_)) = &result {
            self.root.record_element();
        }
        result
    }

    fn save(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.controller.pause();
        let result = self.input.save(checkpoint);
        self.controller.resume();
        result
    }

    fn restore(&mut self, _ctx: &IteratorContext, checkpoint: &Checkpoint) -> Result<()> {
        self.controller.pause();
        let result = self.input.restore(&self.ctx, checkpoint);
        self.controller.resume();
        result
    }
}

impl<I> Drop for ModelIterator<I> {
    fn drop(&mut self) {
        self.controller.cancel();
    }
}

impl<I> std::fmt::Debug for ModelIterator<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelIterator")
            .field("controller", &self.controller)
            .field("model", &self.model)
            .field("budgets", &self.budgets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutotuneError;
    use crate::host::StaticResources;
    use crate::model::PARALLELISM;
    use crate::ops::{DatasetExt, Range};

    fn options() -> AutotuneOptions {
        AutotuneOptions::new()
            .with_cpu_budget(2)
            .with_ram_budget(1 << 20)
    }

    #[test]
    fn test_negative_budget_rejected() {
        let err = ModelDataset::new(Range::new(0, 1), AutotuneOptions::new().with_cpu_budget(-1))
            .unwrap_err();
        assert!(err.is_configuration());
        let err = ModelDataset::new(Range::new(0, 1), AutotuneOptions::new().with_ram_budget(-1))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_budgets_resolve_against_probe() {
        let dataset = Range::new(0, 1)
            .autotune(AutotuneOptions::new().with_probe(Arc::new(StaticResources::new(6, 1000))))
            .unwrap();
        let it = dataset.make_iterator(&IteratorContext::default()).unwrap();
        assert_eq!(it.budgets(), Budgets::new(6, 500));
    }

    #[test]
    fn test_nested_operators_join_the_model() {
        let dataset = Range::new(0, 8)
            .parallel_map(|x| Ok(x + 1))
            .batch(2)
            .autotune(options())
            .unwrap();
        let it = dataset.make_iterator(&IteratorContext::default()).unwrap();
        assert_eq!(it.model().num_nodes(), 4);
        let names: Vec<String> = it
            .model()
            .parameter_vector()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["ParallelMap(id:2).parallelism".to_string()]);
    }

    #[test]
    fn test_transparent_iteration() {
        let ctx = IteratorContext::default();
        let dataset = Range::new(0, 20)
            .parallel_map(|x| Ok(x * 3))
            .autotune(options())
            .unwrap();
        let mut it = dataset.make_iterator(&ctx).unwrap();
        assert_eq!(it.controller_state(), ControllerState::Idle);

        let mut out = Vec::new();
        while let Some(x) = it.get_next(&ctx).unwrap() {
            out.push(x);
        }
        assert_eq!(out, (0..20).map(|x| x * 3).collect::<Vec<_>>());
        assert_eq!(it.controller_state(), ControllerState::Running);
        assert_eq!(it.num_input_events(), 20);
        assert_eq!(it.node().num_elements(), 20);
    }

    #[test]
    fn test_upstream_error_forwarded_unchanged() {
        let ctx = IteratorContext::default();
        let dataset = Range::new(0, 3)
            .parallel_map(|x| {
                if x == 1 {
                    Err(AutotuneError::OutOfRange("index 1".to_string()))
                } else {
                    Ok(x)
                }
            })
            .autotune(options())
            .unwrap();
        let mut it = dataset.make_iterator(&ctx).unwrap();
        assert_eq!(it.get_next(&ctx).unwrap(), Some(0));
        assert!(matches!(
            it.get_next(&ctx),
            Err(AutotuneError::OutOfRange(m)) if m == "index 1"
        ));
        assert_eq!(it.get_next(&ctx).unwrap(), Some(2));
    }

    #[test]
    fn test_save_restore_resumes_sequence() {
        let ctx = IteratorContext::default();
        let dataset = Range::new(0, 30)
            .parallel_map(|x| Ok(x * 2))
            .prefetch()
            .autotune(options())
            .unwrap();

        let mut it = dataset.make_iterator(&ctx).unwrap();
        for _ in 0..5 {
            it.get_next(&ctx).unwrap();
        }
        let mut checkpoint = Checkpoint::new();
        it.save(&mut checkpoint).unwrap();
        assert!(checkpoint.contains("Model::Prefetch::ParallelMap::Range", "next"));

        let mut restored = dataset.make_iterator(&ctx).unwrap();
        restored.restore(&ctx, &checkpoint).unwrap();
        let mut rest = Vec::new();
        while let Some(x) = restored.get_next(&ctx).unwrap() {
            rest.push(x);
        }
        assert_eq!(rest, (5..30).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_cpu_budget_of_one_keeps_parallelism_at_one() {
        let ctx = IteratorContext::default();
        let dataset = Range::new(0, 200)
            .parallel_map(|x| {
                std::thread::sleep(std::time::Duration::from_millis(1));
                Ok(x)
            })
            .with_max_parallelism(8)
            .autotune(options().with_cpu_budget(1))
            .unwrap();
        let mut it = dataset.make_iterator(&ctx).unwrap();
        while it.get_next(&ctx).unwrap().is_some() {}
        let (_, parallelism) = it
            .model()
            .parameter_vector()
            .into_iter()
            .find(|(name, _)| name.ends_with(PARALLELISM))
            .unwrap();
        assert_eq!(parallelism, 1);
    }
}
