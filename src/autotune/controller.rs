//! Background Optimization Controller
//!
//! One controller runs per facade iterator. It owns a single thread,
//! `autotune-model`, which wakes on a doubling period and asks the model to
//! re-tune the pipeline.
//!
//! # Lifecycle
//!
//! ```text
//!  Idle ──first request──> Running ──cancel──> Cancelled
//!    └────────────────cancel────────────────────┘
//! ```
//!
//! The thread is only started by the first request, so building an
//! iterator that is never pulled costs nothing.
//!
//! # Backoff
//!
//! The period starts at `initial_period_ms` and doubles after every cycle up
//! to `max_period_ms`. It is never reset. The wait on the condition variable
//! is bounded by the remaining period, so a cancel is seen within one period.
//!
//! # Locking
//!
//! The controller lock guards the timing recorder, the lifecycle state and
//! the pause flags. It is never held while the model optimizes or while the
//! consumer is inside the upstream iterator.

use super::recorder::TimingRecorder;
use crate::config::AutotuneAlgorithm;
use crate::error::Result;
use crate::host::{Budgets, ClockRef};
use crate::model::{Model, OptimizeOutcome};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Name of the controller thread.
pub const THREAD_NAME: &str = "autotune-model";

/// Doubling period with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    period_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            period_ms: initial_ms.min(max_ms),
            max_ms,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Double the period, capped at the maximum, and return the new value.
    pub fn advance(&mut self) -> u64 {
        self.period_ms = self.period_ms.saturating_mul(2).min(self.max_ms);
        self.period_ms
    }
}

/// Lifecycle of the controller thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No request seen yet, no thread
    Idle,
    /// Thread alive
    Running,
    /// Terminal
    Cancelled,
}

#[derive(Debug)]
struct ControlState {
    recorder: TimingRecorder,
    state: ControllerState,
    paused: bool,
    optimizing: bool,
    backoff: Backoff,
    cycles: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything the controller thread needs, moved into it on start.
struct Tuner {
    shared: Arc<Shared>,
    model: Arc<Model>,
    algorithm: AutotuneAlgorithm,
    budgets: Budgets,
    clock: ClockRef,
}

/// Owner of the `autotune-model` thread.
pub struct Controller {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    model: Arc<Model>,
    algorithm: AutotuneAlgorithm,
    budgets: Budgets,
    clock: ClockRef,
}

impl Controller {
    /// Create an idle controller. Backoff periods come from the model's settings.
    pub fn new(
        model: Arc<Model>,
        algorithm: AutotuneAlgorithm,
        budgets: Budgets,
        clock: ClockRef,
    ) -> Self {
        let settings = model.settings();
        let backoff = Backoff::new(settings.initial_period_ms, settings.max_period_ms);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControlState {
                    recorder: TimingRecorder::new(),
                    state: ControllerState::Idle,
                    paused: false,
                    optimizing: false,
                    backoff,
                    cycles: 0,
                }),
                cond: Condvar::new(),
            }),
            handle: None,
            model,
            algorithm,
            budgets,
            clock,
        }
    }

    /// Called when a request enters the facade.
    ///
    /// Starts the thread on the first call and records the consumer gap.
    pub fn begin_request(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.state == ControllerState::Idle {
            let tuner = Tuner {
                shared: self.shared.clone(),
                model: self.model.clone(),
                algorithm: self.algorithm,
                budgets: self.budgets,
                clock: self.clock.clone(),
            };
            let handle = thread::Builder::new()
                .name(THREAD_NAME.to_string())
                .spawn(move || tuner.run())?;
            self.handle = Some(handle);
            state.state = ControllerState::Running;
            tracing::debug!(
                algorithm = %self.algorithm,
                cpu_budget = self.budgets.cpu,
                ram_budget = self.budgets.ram,
                "Started autotune controller"
            );
        }
        state.recorder.record_input(self.clock.now_ns());
        Ok(())
    }

    /// Called when a request leaves the facade, whatever its result.
    pub fn end_request(&self) {
        self.shared.lock().recorder.record_output(self.clock.now_ns());
    }

    /// Hold off further optimizations and wait for one in progress to commit.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        state.paused = true;
        while state.optimizing {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.cond.notify_all();
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn cancel(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.state == ControllerState::Cancelled && self.handle.is_none() {
                return;
            }
            state.state = ControllerState::Cancelled;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Autotune controller thread panicked");
            } else {
                tracing::debug!("Autotune controller stopped");
            }
        }
    }

    pub fn state(&self) -> ControllerState {
        self.shared.lock().state
    }

    /// Mean consumer gap between requests, in nanoseconds.
    pub fn self_input_time_ns(&self) -> u64 {
        self.shared.lock().recorder.self_input_time_ns()
    }

    pub fn num_input_events(&self) -> u64 {
        self.shared.lock().recorder.num_input_events()
    }

    /// Current optimization period.
    pub fn period_ms(&self) -> u64 {
        self.shared.lock().backoff.period_ms()
    }

    /// Completed optimization cycles.
    pub fn cycles(&self) -> u64 {
        self.shared.lock().cycles
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Controller")
            .field("state", &state.state)
            .field("algorithm", &self.algorithm)
            .field("budgets", &self.budgets)
            .field("period_ms", &state.backoff.period_ms())
            .field("cycles", &state.cycles)
            .finish()
    }
}

impl Tuner {
    fn run(self) {
        let mut current_ms = self.clock.now_ms();
        let mut last_optimization_ms = 0u64;

        loop {
            let input_time_ns = {
                let mut state = self.shared.lock();
                loop {
                    if state.state == ControllerState::Cancelled {
                        return;
                    }
                    let due = last_optimization_ms.saturating_add(state.backoff.period_ms());
                    if !state.paused && due <= current_ms {
                        break;
                    }
                    let wait_ms = if state.paused {
                        state.backoff.period_ms()
                    } else {
                        due - current_ms
                    };
                    state = self
                        .shared
                        .cond
                        .wait_timeout(state, Duration::from_millis(wait_ms.max(1)))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    current_ms = self.clock.now_ms();
                }
                state.optimizing = true;
                state.recorder.self_input_time_ns()
            };

            self.model.record_observed_input_time(input_time_ns);
            let outcome = self.model.optimize(
                self.algorithm,
                self.budgets.cpu,
                self.budgets.ram,
                0.0,
            );

            let (period_ms, cycle) = {
                let mut state = self.shared.lock();
                state.optimizing = false;
                state.cycles += 1;
                (state.backoff.advance(), state.cycles)
            };
            self.shared.cond.notify_all();

            current_ms = self.clock.now_ms();
            last_optimization_ms = current_ms;
            self.model.flush_metrics();

            match outcome {
                OptimizeOutcome::Committed { changed } => tracing::debug!(
                    cycle,
                    changed,
                    input_time_ns,
                    next_period_ms = period_ms,
                    "Autotune cycle committed"
                ),
                OptimizeOutcome::Skipped => tracing::debug!(
                    cycle,
                    next_period_ms = period_ms,
                    "Autotune cycle skipped"
                ),
                OptimizeOutcome::Warning(warning) => tracing::debug!(
                    cycle,
                    %warning,
                    next_period_ms = period_ms,
                    "Autotune cycle kept current parameters"
                ),
            }
        }
    }
}
