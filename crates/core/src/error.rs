//! Centralized error types for the Arbiter workspace.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Top-level error enum. Variants map to failure categories, not subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArbiterError {
    /// A blocking wait observed cancellation before its condition held.
    #[error("operation cancelled")]
    Cancelled,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A user task body returned an error or panicked.
    #[error("Task failed: {0}")]
    Task(String),

    /// Several independent callbacks failed in one batch. `first` is the
    /// error of the earliest failing callback.
    #[error("{first} ({} more suppressed)", suppressed.len())]
    Aggregate {
        first: Box<ArbiterError>,
        suppressed: Vec<ArbiterError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ArbiterResult<T> = Result<T, ArbiterError>;

impl ArbiterError {
    /// Wraps any displayable failure as a task error.
    pub fn task(err: impl fmt::Display) -> Self {
        ArbiterError::Task(err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            ArbiterError::Cancelled => true,
            ArbiterError::Aggregate { first, .. } => first.is_cancelled(),
            _ => false,
        }
    }

    /// Errors attached behind the primary one, empty for non-aggregates.
    pub fn suppressed(&self) -> &[ArbiterError] {
        match self {
            ArbiterError::Aggregate { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Converts a caught panic payload into a task error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ArbiterError::Task(format!("panicked: {msg}"))
    }
}

/// Runs a batch to completion and keeps every failure.
///
/// The first error becomes the reported one; later errors are attached as
/// suppressed so no failure is dropped and no sibling is skipped.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    first: Option<ArbiterError>,
    suppressed: Vec<ArbiterError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ArbiterError) {
        if self.first.is_none() {
            self.first = Some(err);
        } else {
            self.suppressed.push(err);
        }
    }

    /// Records the error side of `result`, if any.
    pub fn record<T>(&mut self, result: ArbiterResult<T>) {
        if let Err(e) = result {
            self.push(e);
        }
    }

    /// Runs `f`, recording its error or, if it panics, the panic as a
    /// task error.
    pub fn run(&mut self, f: impl FnOnce() -> ArbiterResult<()>) {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => self.record(result),
            Err(payload) => self.push(ArbiterError::from_panic(payload)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn finish(self) -> ArbiterResult<()> {
        match self.first {
            None => Ok(()),
            Some(first) if self.suppressed.is_empty() => Err(first),
            Some(first) => Err(ArbiterError::Aggregate {
                first: Box::new(first),
                suppressed: self.suppressed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_collector_is_ok() {
        assert!(ErrorCollector::new().finish().is_ok());
    }

    #[test]
    fn single_error_is_returned_as_is() {
        let mut c = ErrorCollector::new();
        c.record::<()>(Ok(()));
        c.push(ArbiterError::Cancelled);
        let err = c.finish().unwrap_err();
        assert!(matches!(err, ArbiterError::Cancelled));
        assert!(err.suppressed().is_empty());
    }

    #[test]
    fn later_errors_are_suppressed_behind_first() {
        let mut c = ErrorCollector::new();
        c.push(ArbiterError::Task("a".into()));
        c.push(ArbiterError::Task("b".into()));
        c.push(ArbiterError::Cancelled);

        let err = c.finish().unwrap_err();
        match &err {
            ArbiterError::Aggregate { first, suppressed } => {
                assert!(matches!(**first, ArbiterError::Task(ref m) if m == "a"));
                assert_eq!(suppressed.len(), 2);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(err.to_string(), "Task failed: a (2 more suppressed)");
    }

    #[test]
    fn run_records_errors_and_panics() {
        let mut c = ErrorCollector::new();
        c.run(|| Ok(()));
        c.run(|| panic!("first"));
        c.run(|| Err(ArbiterError::Cancelled));
        let err = c.finish().unwrap_err();
        assert_eq!(err.to_string(), "Task failed: panicked: first (1 more suppressed)");
    }

    #[test]
    fn panic_payloads_become_task_errors() {
        let err = ArbiterError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "Task failed: panicked: boom");
    }
}
