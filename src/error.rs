//! Error handling for the pipeline autotuner
//!
//! This module defines the crate error type and a Result alias used
//! throughout the library. Upstream iterator failures travel through
//! [`AutotuneError::Upstream`] and [`AutotuneError::OutOfRange`] unchanged;
//! the facade never rewrites them.

use thiserror::Error;

/// Main error type for autotuner operations
#[derive(Error, Debug)]
pub enum AutotuneError {
    /// Invalid construction arguments, config files or algorithm names
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An upstream operator failed while producing an element
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// An upstream operator was asked for data it cannot produce
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// A checkpoint key was missing or held a value of the wrong shape
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A worker thread or channel went away underneath an operator
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<AutotuneError>,
    },
}

impl AutotuneError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        AutotuneError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the innermost error
    pub fn root(&self) -> &AutotuneError {
        match self {
            AutotuneError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a configuration error, looking through context
    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), AutotuneError::Configuration(_))
    }
}

impl From<serde_json::Error> for AutotuneError {
    fn from(err: serde_json::Error) -> Self {
        AutotuneError::Serialization(err.to_string())
    }
}

/// Result type alias for autotuner operations
pub type Result<T> = std::result::Result<T, AutotuneError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutotuneError::Configuration("cpu_budget must be >= 0".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: cpu_budget must be >= 0"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = AutotuneError::Upstream("disk read failed".to_string());
        let with_ctx = err.with_context("prefetch worker");
        assert!(with_ctx.to_string().contains("prefetch worker"));
        assert!(matches!(with_ctx.root(), AutotuneError::Upstream(_)));
    }

    #[test]
    fn test_is_configuration_looks_through_context() {
        let err: Result<()> = Err(AutotuneError::Configuration("bad".into()));
        let err = err.context("loading autotune.toml").unwrap_err();
        assert!(err.is_configuration());
        assert!(!AutotuneError::Checkpoint("x".into()).is_configuration());
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("\"nope\"");
        let err: AutotuneError = parse.unwrap_err().into();
        assert!(matches!(err, AutotuneError::Serialization(_)));
    }
}
