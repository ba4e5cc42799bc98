//! Runtime tuning of a running pipeline
//!
//! Wrapping a dataset with [`ModelDataset`] (or [`DatasetExt::autotune`])
//! makes every iterator it creates build a performance model of the nested
//! operators and start a background [`Controller`] on the first request.
//! The controller re-optimizes on an exponentially growing period and
//! writes new parameter values that the operators pick up on their next
//! check.
//!
//! # Main Types
//!
//! - [`ModelDataset`] / [`ModelIterator`] - Transparent facade
//! - [`AutotuneOptions`] - Algorithm, budgets, sink and probe
//! - [`Controller`] - Owner of the `autotune-model` thread
//! - [`TimingRecorder`] - Consumer gap between requests
//!
//! [`DatasetExt::autotune`]: crate::ops::DatasetExt::autotune

pub mod controller;
pub mod facade;
pub mod options;
pub mod recorder;

pub use controller::{Backoff, Controller, ControllerState};
pub use facade::{ModelDataset, ModelIterator};
pub use options::AutotuneOptions;
pub use recorder::TimingRecorder;
