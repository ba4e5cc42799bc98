//! Worker engine behind the asynchronous operators.
//!
//! An [`AsyncBuffer`] pulls elements from its input on background worker
//! threads, applies a transform and delivers results in input order.
//!
//! # Flow Control
//!
//! Every element a worker claims counts as *outstanding* until the consumer
//! takes it. Workers only claim while `outstanding < capacity`, where
//! capacity is the operator's tunable parameter read on every check, so a
//! new value committed by the optimizer takes effect within one poll
//! interval. A capacity of 0 still serves a waiting consumer one element at
//! a time.
//!
//! The input sits behind its own lock. A worker reserves a slot under the
//! engine lock, releases it, and only then pulls from the input, so a slow
//! upstream never holds up a consumer taking an element that is already
//! buffered. Sequence numbers are handed out while the input lock is held
//! and therefore follow input order. Results travel over a
//! `crossbeam-channel` and are put back in order by a small reorder map on
//! the consumer side.
//!
//! Lock order is input before engine state.
//!
//! # Checkpointing
//!
//! `save` and `restore` pause the workers, wait for in-flight elements to
//! land, and then write or read the input's state together with the
//! buffered results.

use crate::error::{AutotuneError, Result, ResultExt};
use crate::iterator::{Checkpoint, DatasetIterator, ElementSize, IteratorContext};
use crate::model::{Node, ParamRef};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Element transform run on worker threads.
pub type Transform<T, U> = Arc<dyn Fn(T) -> Result<U> + Send + Sync>;

type Message<U> = (u64, Result<Option<U>>);

/// How often an idle worker re-reads the capacity parameter.
const PARAMETER_POLL: Duration = Duration::from_millis(5);

struct State {
    next_seq: u64,
    outstanding: usize,
    end_of_input: bool,
    waiting: usize,
    active: usize,
    paused: bool,
    cancelled: bool,
}

impl State {
    fn can_claim(&self, capacity: i64) -> bool {
        if self.paused || self.end_of_input {
            return false;
        }
        let capacity = capacity.max(0) as usize;
        self.outstanding < capacity || (self.outstanding == 0 && self.waiting > 0)
    }
}

struct Shared<I> {
    input: Mutex<I>,
    state: Mutex<State>,
    cond: Condvar,
}

impl<I> Shared<I> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_input(&self) -> MutexGuard<'_, I> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize, Deserialize)]
enum SavedEntry<U> {
    Element(U),
    End,
    Error(String),
}

pub(crate) struct AsyncBuffer<I: DatasetIterator, U> {
    name: &'static str,
    node: Arc<Node>,
    capacity: ParamRef,
    max_workers: usize,
    ctx: IteratorContext,
    transform: Transform<I::Item, U>,
    shared: Arc<Shared<I>>,
    sender: Sender<Message<U>>,
    receiver: Receiver<Message<U>>,
    reorder: BTreeMap<u64, Result<Option<U>>>,
    next_out: u64,
    finished: bool,
    workers: Vec<JoinHandle<()>>,
}

impl<I: DatasetIterator, U> AsyncBuffer<I, U> {
    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

impl<I, U> AsyncBuffer<I, U>
where
    I: DatasetIterator + 'static,
    I::Item: Send + 'static,
    U: ElementSize + Send + 'static,
{
    /// `ctx` is the context the input iterator was created with.
    pub(crate) fn new(
        name: &'static str,
        node: Arc<Node>,
        capacity: ParamRef,
        max_workers: usize,
        ctx: IteratorContext,
        input: I,
        transform: Transform<I::Item, U>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            name,
            node,
            capacity,
            max_workers: max_workers.max(1),
            ctx,
            transform,
            shared: Arc::new(Shared {
                input: Mutex::new(input),
                state: Mutex::new(State {
                    next_seq: 0,
                    outstanding: 0,
                    end_of_input: false,
                    waiting: 0,
                    active: 0,
                    paused: false,
                    cancelled: false,
                }),
                cond: Condvar::new(),
            }),
            sender,
            receiver,
            reorder: BTreeMap::new(),
            next_out: 0,
            finished: false,
            workers: Vec::new(),
        }
    }

    /// Grow the worker pool to the current capacity, up to `max_workers`.
    fn ensure_workers(&mut self) -> Result<()> {
        let wanted = (self.capacity.load().max(1) as usize).min(self.max_workers);
        while self.workers.len() < wanted {
            let worker = Worker {
                shared: self.shared.clone(),
                sender: self.sender.clone(),
                transform: self.transform.clone(),
                capacity: self.capacity.clone(),
                node: self.node.clone(),
                ctx: self.ctx.clone(),
            };
            let index = self.workers.len();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, index))
                .spawn(move || worker.run())?;
            tracing::trace!("Started {} worker {}", self.node.long_name(), index);
            self.workers.push(handle);
        }
        Ok(())
    }

    fn set_waiting(&self, waiting: bool) {
        {
            let mut state = self.shared.lock();
            if waiting {
                state.waiting += 1;
            } else {
                state.waiting -= 1;
            }
        }
        self.shared.cond.notify_all();
    }

    fn release_one(&self) {
        {
            let mut state = self.shared.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.shared.cond.notify_all();
    }

    pub(crate) fn get_next(&mut self) -> Result<Option<U>> {
        loop {
            if let Some(result) = self.reorder.remove(&self.next_out) {
                self.next_out += 1;
                self.release_one();
                return match result {
                    Ok(Some(element)) => {
                        let size = element.element_size();
                        self.node.record_buffer_event(-(size as i64), -1);
                        self.node.record_element();
                        self.node.record_bytes_produced(size);
                        Ok(Some(element))
                    }
                    Ok(None) => {
                        self.finished = true;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                };
            }
            if self.finished {
                return Ok(None);
            }

            self.ensure_workers()?;
            self.set_waiting(true);
            let message = self.receiver.recv();
            self.set_waiting(false);
            match message {
                Ok((seq, result)) => {
                    self.reorder.insert(seq, result);
                }
                Err(_) => {
                    return Err(AutotuneError::Channel(format!(
                        "{} lost its workers",
                        self.node.long_name()
                    )))
                }
            }
        }
    }

    /// Stop claiming and wait until every claimed element has been delivered.
    fn pause(&mut self) {
        {
            let mut state = self.shared.lock();
            state.paused = true;
            while state.active > 0 {
                state = self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        while let Ok((seq, result)) = self.receiver.try_recv() {
            self.reorder.insert(seq, result);
        }
    }

    fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.cond.notify_all();
    }

    pub(crate) fn save(&mut self, prefix: &str, checkpoint: &mut Checkpoint) -> Result<()>
    where
        U: Serialize,
    {
        self.pause();
        let result = self.save_paused(prefix, checkpoint);
        self.resume();
        result
    }

    fn save_paused(&mut self, prefix: &str, checkpoint: &mut Checkpoint) -> Result<()>
    where
        U: Serialize,
    {
        self.shared.lock_input().save(checkpoint)?;

        let entries: Vec<SavedEntry<&U>> = self
            .reorder
            .values()
            .map(|result| match result {
                Ok(Some(element)) => SavedEntry::Element(element),
                Ok(None) => SavedEntry::End,
                Err(e) => SavedEntry::Error(e.to_string()),
            })
            .collect();
        checkpoint.write(prefix, "buffer", &entries)?;
        checkpoint.write(prefix, "finished", &self.finished)?;
        tracing::debug!(
            "Saved {} with {} buffered entries",
            self.node.long_name(),
            entries.len()
        );
        Ok(())
    }

    pub(crate) fn restore(&mut self, prefix: &str, checkpoint: &Checkpoint) -> Result<()>
    where
        U: DeserializeOwned,
    {
        self.pause();
        let result = self.restore_paused(prefix, checkpoint);
        self.resume();
        result
    }

    fn restore_paused(&mut self, prefix: &str, checkpoint: &Checkpoint) -> Result<()>
    where
        U: DeserializeOwned,
    {
        let entries: Vec<SavedEntry<U>> = checkpoint
            .read(prefix, "buffer")
            .with_context(|| format!("restoring {}", self.node.long_name()))?;
        let finished: bool = checkpoint.read(prefix, "finished")?;
        self.shared.lock_input().restore(&self.ctx, checkpoint)?;

        for element in self.reorder.values().filter_map(|r| r.as_ref().ok()).flatten() {
            self.node
                .record_buffer_event(-(element.element_size() as i64), -1);
        }
        self.reorder.clear();

        let mut end_of_input = finished;
        for (offset, entry) in entries.into_iter().enumerate() {
            let result = match entry {
                SavedEntry::Element(element) => {
                    self.node
                        .record_buffer_event(element.element_size() as i64, 1);
                    Ok(Some(element))
                }
                SavedEntry::End => {
                    end_of_input = true;
                    Ok(None)
                }
                SavedEntry::Error(message) => Err(AutotuneError::Upstream(message)),
            };
            self.reorder.insert(self.next_out + offset as u64, result);
        }

        let mut state = self.shared.lock();
        state.next_seq = self.next_out + self.reorder.len() as u64;
        state.outstanding = self.reorder.len();
        state.end_of_input = end_of_input;
        drop(state);

        self.finished = finished;
        tracing::debug!(
            "Restored {} with {} buffered entries",
            self.node.long_name(),
            self.reorder.len()
        );
        Ok(())
    }
}

impl<I: DatasetIterator, U> Drop for AsyncBuffer<I, U> {
    fn drop(&mut self) {
        self.shared.lock().cancelled = true;
        self.shared.cond.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("{} worker panicked", self.name);
            }
        }
    }
}

struct Worker<I: DatasetIterator, U> {
    shared: Arc<Shared<I>>,
    sender: Sender<Message<U>>,
    transform: Transform<I::Item, U>,
    capacity: ParamRef,
    node: Arc<Node>,
    ctx: IteratorContext,
}

impl<I, U> Worker<I, U>
where
    I: DatasetIterator,
    U: ElementSize,
{
    fn run(self) {
        loop {
            if !self.claim() {
                return;
            }
            let Some((seq, input)) = self.pull() else {
                continue;
            };

            let result = match input {
                Ok(Some(element)) => self.apply(element),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            if let Ok(Some(element)) = &result {
                self.node
                    .record_buffer_event(element.element_size() as i64, 1);
            }

            let delivered = self.sender.send((seq, result)).is_ok();
            self.finish();
            if !delivered {
                return;
            }
        }
    }

    /// Reserve one buffer slot; false once the engine is cancelled.
    fn claim(&self) -> bool {
        let mut state = self.shared.lock();
        loop {
            if state.cancelled {
                return false;
            }
            if state.can_claim(self.capacity.load()) {
                break;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, PARAMETER_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.outstanding += 1;
        state.active += 1;
        true
    }

    /// Pull the next input element for a claimed slot.
    ///
    /// Gives the slot back and returns `None` when another worker already
    /// reached the end of the input.
    fn pull(&self) -> Option<(u64, Result<Option<I::Item>>)> {
        let mut input = self.shared.lock_input();
        if self.shared.lock().end_of_input {
            drop(input);
            self.shared.lock().outstanding -= 1;
            self.finish();
            return None;
        }

        let next = input.get_next(&self.ctx);
        let mut state = self.shared.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        if matches!(next, Ok(None)) {
            state.end_of_input = true;
        }
        Some((seq, next))
    }

    fn finish(&self) {
        self.shared.lock().active -= 1;
        self.shared.cond.notify_all();
    }

    fn apply(&self, element: I::Item) -> Result<Option<U>> {
        self.node.record_start(self.ctx.now_ns());
        let output = panic::catch_unwind(AssertUnwindSafe(|| (self.transform)(element)));
        self.node.record_stop(self.ctx.now_ns());
        match output {
            Ok(result) => result.map(Some),
            Err(_) => Err(AutotuneError::Upstream(format!(
                "transform in {} panicked",
                self.node.long_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::Dataset;
    use crate::model::{NodeBuilder, NodeKind, Parameter, PARALLELISM};
    use crate::ops::range::Range;

    fn engine(
        capacity: i64,
        max: i64,
        end: i64,
    ) -> AsyncBuffer<<Range as Dataset>::Iter, i64> {
        let ctx = IteratorContext::default();
        let parameter = Parameter::new(PARALLELISM, capacity, 0, max).unwrap().shared();
        let node = Node::detached(
            NodeBuilder::new("Engine", NodeKind::Async(1.0)).parameter(parameter.clone()),
        )
        .unwrap();
        let child = ctx.child(node.clone(), "Engine");
        let input = Range::new(0, end).make_iterator(&child).unwrap();
        AsyncBuffer::new(
            "engine",
            node,
            parameter,
            max as usize,
            child,
            input,
            Arc::new(|x: i64| -> Result<i64> { Ok(x * 10) }),
        )
    }

    fn drain(buffer: &mut AsyncBuffer<<Range as Dataset>::Iter, i64>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(x) = buffer.get_next().unwrap() {
            out.push(x);
        }
        out
    }

    #[test]
    fn test_results_arrive_in_input_order() {
        let mut buffer = engine(4, 4, 50);
        let out = drain(&mut buffer);
        assert_eq!(out, (0..50).map(|x| x * 10).collect::<Vec<_>>());
        assert_eq!(buffer.node().num_elements(), 50);
        assert!(buffer.get_next().unwrap().is_none());
    }

    #[test]
    fn test_zero_capacity_serves_on_demand() {
        let mut buffer = engine(0, 4, 5);
        assert_eq!(drain(&mut buffer), vec![0, 10, 20, 30, 40]);
        assert_eq!(buffer.num_workers(), 1);
    }

    #[test]
    fn test_buffer_accounting_returns_to_zero() {
        let mut buffer = engine(3, 3, 20);
        drain(&mut buffer);
        assert_eq!(buffer.node().buffered_elements(), 0);
        assert_eq!(buffer.node().buffered_bytes(), 0);
        assert_eq!(buffer.node().bytes_produced(), 20 * 8);
    }

    #[test]
    fn test_save_restore_resumes_sequence() {
        let mut buffer = engine(4, 4, 30);
        let mut head = Vec::new();
        for _ in 0..7 {
            head.push(buffer.get_next().unwrap().unwrap());
        }
        let mut checkpoint = Checkpoint::new();
        buffer.save("Engine", &mut checkpoint).unwrap();
        let rest_original = drain(&mut buffer);

        let mut fresh = engine(4, 4, 30);
        fresh.restore("Engine", &checkpoint).unwrap();
        assert_eq!(drain(&mut fresh), rest_original);
        assert_eq!(head, (0..7).map(|x| x * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_transform_error_is_forwarded_in_order() {
        let ctx = IteratorContext::default();
        let parameter = Parameter::new(PARALLELISM, 2, 1, 2).unwrap().shared();
        let node = Node::detached(
            NodeBuilder::new("Engine", NodeKind::Async(1.0)).parameter(parameter.clone()),
        )
        .unwrap();
        let child = ctx.child(node.clone(), "Engine");
        let input = Range::new(0, 4).make_iterator(&child).unwrap();
        let mut buffer = AsyncBuffer::new(
            "engine",
            node,
            parameter,
            2,
            child,
            input,
            Arc::new(|x: i64| -> Result<i64> {
                if x == 2 {
                    Err(AutotuneError::Upstream("bad element".to_string()))
                } else {
                    Ok(x)
                }
            }),
        );
        assert_eq!(buffer.get_next().unwrap(), Some(0));
        assert_eq!(buffer.get_next().unwrap(), Some(1));
        assert!(matches!(
            buffer.get_next(),
            Err(AutotuneError::Upstream(m)) if m == "bad element"
        ));
        assert_eq!(buffer.get_next().unwrap(), Some(3));
        assert_eq!(buffer.get_next().unwrap(), None);
    }
}
