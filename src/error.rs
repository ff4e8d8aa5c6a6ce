//! Error and fault payload types.
//!
//! Faults that originate from a task body are Rust panics: a task is run
//! inside [`std::panic::catch_unwind`] and a captured panic is re-raised via
//! [`std::panic::resume_unwind`] the next time the task is forced, turning
//! a panic into an ordinary value that can cross a thread boundary.
//!
//! Invalid *user input* (wrong buffer length, zero work-unit size, forcing a
//! task that was never submitted, reducing nothing without a seed) is not a
//! fault raised by a task body — it is checked eagerly and reported as a
//! [`PreconditionError`].

use std::any::Any;
use std::fmt;

// -----------------------------------------------------------------------------
// Panic payloads

/// A single task body's captured panic payload.
pub type Fault = Box<dyn Any + Send + 'static>;

/// Several execution faults chained together, raised from a data-parallel
/// driver once every in-flight work unit has completed.
///
/// Order of `faults` is unspecified: work units may finish in any order.
#[derive(Debug, Default)]
pub struct AggregatedFault {
    pub faults: Vec<Fault>,
}

impl AggregatedFault {
    /// Builds an aggregated fault from a list of captured work-unit panics.
    ///
    /// Returns `None` if `faults` is empty (i.e. nothing actually failed).
    pub fn from_faults(faults: Vec<Fault>) -> Option<Self> {
        if faults.is_empty() { None } else { Some(Self { faults }) }
    }

    /// Re-raises this fault as an ordinary panic carrying its [`Display`]
    /// message. Panicking with a formatted `String`, rather than
    /// `resume_unwind`ing this struct directly, is what lets the default
    /// panic hook (and `#[should_panic(expected = ..)]` in tests) show a
    /// readable message instead of an opaque "Box<dyn Any>".
    pub fn resume(self) -> ! {
        panic!("{self}")
    }
}

impl fmt::Display for AggregatedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed inside a parallel operation", self.faults.len())
    }
}

/// Raised when a `parallel`/`parallel_indexed` body returns
/// [`ForeachControl::Break`](crate::foreach::ForeachControl::Break).
///
/// Other faults from concurrently-running work units of the same loop are
/// chained into `other`, since submission stops but already-started work
/// units are allowed to run to completion.
#[derive(Debug, Default)]
pub struct ForeachBreak {
    pub other: Vec<Fault>,
}

impl ForeachBreak {
    /// See [`AggregatedFault::resume`] for why this panics with a formatted
    /// message instead of `resume_unwind`ing the struct itself.
    pub fn resume(self) -> ! {
        panic!("{self}")
    }
}

impl fmt::Display for ForeachBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a parallel foreach body broke out of the loop")
    }
}

// -----------------------------------------------------------------------------
// PreconditionError

/// Invalid user input rejected before any task is ever submitted.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PreconditionError {
    #[error("work-unit size must be non-zero")]
    ZeroWorkUnit,

    #[error("output buffer has length {actual}, expected {expected}")]
    WrongBufferLength { expected: usize, actual: usize },

    #[error("forced a task that was never submitted to a pool")]
    NeverSubmitted,

    #[error("reduce over an empty range requires an explicit seed")]
    EmptyReduce,

    #[error("submitted a task to a pool that is no longer running")]
    PoolNotRunning,
}
