//! Tunable operator parameters.
//!
//! A [`Parameter`] is shared between the operator that reads it on its hot
//! path and the node that exposes it to the optimizer. Values are stored in
//! an atomic and are clamped on every write, so a reader can never observe a
//! value outside `[min, max]`.

use crate::error::{AutotuneError, Result};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Name of the degree-of-parallelism parameter.
pub const PARALLELISM: &str = "parallelism";

/// Name of the buffer-capacity parameter.
pub const BUFFER_SIZE: &str = "buffer_size";

/// Sentinel requesting that the autotuner pick a value.
pub const AUTOTUNE: i64 = -1;

/// Shared handle to a parameter.
pub type ParamRef = Arc<Parameter>;

/// An integer knob with a declared range.
pub struct Parameter {
    name: String,
    value: AtomicI64,
    min: i64,
    max: i64,
    tunable: bool,
}

impl Parameter {
    /// Create a tunable parameter.
    ///
    /// The initial value is clamped into range, so passing [`AUTOTUNE`]
    /// starts the parameter at `min`.
    pub fn new(name: impl Into<String>, value: i64, min: i64, max: i64) -> Result<Self> {
        let name = name.into();
        if min > max {
            return Err(AutotuneError::Configuration(format!(
                "parameter '{}' has min {} > max {}",
                name, min, max
            )));
        }
        Ok(Self {
            name,
            value: AtomicI64::new(value.clamp(min, max)),
            min,
            max,
            tunable: true,
        })
    }

    /// Create a parameter pinned to a single value, never moved by the optimizer.
    pub fn fixed(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value: AtomicI64::new(value),
            min: value,
            max: value,
            tunable: false,
        }
    }

    /// Mark the parameter as user-controlled.
    ///
    /// The optimizer leaves non-tunable parameters alone but still uses their
    /// values when estimating output time.
    pub fn with_tunable(mut self, tunable: bool) -> Self {
        self.tunable = tunable;
        self
    }

    pub fn shared(self) -> ParamRef {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn is_tunable(&self) -> bool {
        self.tunable
    }

    /// Current value, with acquire ordering.
    #[inline]
    pub fn load(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Store a value clamped into range, with release ordering.
    ///
    /// Returns the value actually stored.
    #[inline]
    pub fn store(&self, value: i64) -> i64 {
        let clamped = value.clamp(self.min, self.max);
        self.value.store(clamped, Ordering::Release);
        clamped
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("value", &self.load())
            .field("min", &self.min)
            .field("max", &self.max)
            .field("tunable", &self.tunable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_autotune_sentinel_starts_at_min() {
        let p = Parameter::new(PARALLELISM, AUTOTUNE, 1, 8).unwrap();
        assert_eq!(p.load(), 1);
        assert!(p.is_tunable());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = Parameter::new(BUFFER_SIZE, 0, 4, 2).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_fixed_parameter() {
        let p = Parameter::fixed(PARALLELISM, 3);
        assert!(!p.is_tunable());
        assert_eq!(p.store(10), 3);
        assert_eq!(p.load(), 3);
    }

    proptest! {
        #[test]
        fn prop_store_stays_in_range(
            min in -1000i64..1000,
            span in 0i64..1000,
            init in any::<i64>(),
            writes in proptest::collection::vec(any::<i64>(), 0..32),
        ) {
            let max = min + span;
            let p = Parameter::new("knob", init, min, max).unwrap();
            prop_assert!(p.load() >= min && p.load() <= max);
            for w in writes {
                let stored = p.store(w);
                prop_assert_eq!(stored, p.load());
                prop_assert!(stored >= min && stored <= max);
            }
        }
    }
}
