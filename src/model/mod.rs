//! Performance model of an input pipeline
//!
//! This module contains the analytical model the autotuner optimizes:
//! a tree of [`Node`]s mirroring the pipeline's operators, the closed-form
//! output-time estimates computed over a [`ModelSnapshot`], and the two
//! search strategies in [`Optimizer`].
//!
//! # Main Types
//!
//! - [`Model`] - Owns the node tree; `add_node`, `optimize`, `flush_metrics`
//! - [`Node`] / [`NodeBuilder`] - One operator's statistics and parameters
//! - [`NodeKind`] - How an operator turns input time into output time
//! - [`Parameter`] - Shared, clamped integer knob read on the hot path
//! - [`ModelSnapshot`] - Frozen pre-order copy used for estimation
//! - [`Optimizer`] - Hill climb and gradient descent
//!
//! # Time Units
//!
//! All times are nanoseconds held in `f64` during estimation and `u64` in
//! statistics.

pub mod id;
pub mod node;
pub mod optimizer;
pub mod parameter;
pub mod pipeline;
pub mod snapshot;
pub mod wait_time;

pub use id::NodeId;
pub use node::{Node, NodeBuilder, NodeKind};
pub use optimizer::{Optimizer, OptimizerWarning};
pub use parameter::{ParamRef, Parameter, AUTOTUNE, BUFFER_SIZE, PARALLELISM};
pub use pipeline::{Model, OptimizeOutcome};
pub use snapshot::{ModelSnapshot, ParameterVector, TunableSlot};
pub use wait_time::{compute_wait_time, WaitTime};
