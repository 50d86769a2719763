use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::{ForkFailure, Stage};

/// Errors that can occur while preparing or executing a benchmark run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The run was configured with contradictory or out-of-range parameters.
    ///
    /// This is always detected before any worker thread or process is started.
    #[error("invalid configuration: {problem}")]
    Configuration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// User payload code panicked, either while setting up a worker thread or while
    /// executing an iteration.
    #[error("payload failed on thread {thread} during {stage}: {message}")]
    Payload {
        /// Label of the thread that failed, in `group#index` form.
        thread: String,

        /// Whether the failure happened during setup or in which iteration.
        stage: Stage,

        /// The panic message, if one could be extracted.
        message: String,
    },

    /// One or more worker threads failed to reach a synchronization point in time.
    ///
    /// This is treated as a hang. The threads involved are abandoned.
    #[error(
        "threads {missing:?} did not reach the synchronization point within {timeout:?} during {stage}"
    )]
    SynchronizationTimeout {
        /// Whether the timeout happened during setup or in which iteration.
        stage: Stage,

        /// How long the coordinator waited.
        timeout: Duration,

        /// Labels of the threads that did not report in time.
        missing: Vec<String>,
    },

    /// The channel to a worker process failed while a response was outstanding.
    #[error("worker channel failed: {reason}")]
    Channel {
        /// A human-readable description of what went wrong.
        reason: String,
    },

    /// A worker process exceeded the per-run timeout and was forcibly terminated.
    #[error("run exceeded its timeout of {timeout:?}")]
    RunTimeout {
        /// The configured per-run timeout.
        timeout: Duration,
    },

    /// A worker process was asked to run a benchmark it does not know about.
    #[error("benchmark '{name}' is not registered")]
    UnknownBenchmark {
        /// The requested benchmark name.
        name: String,
    },

    /// A worker process or thread could not be launched.
    #[error("failed to launch worker: {0}")]
    Spawn(#[source] io::Error),

    /// Every fork of a benchmark failed, so there is no result to report.
    #[error("all {} forks of benchmark '{benchmark}' failed", failures.len())]
    AllForksFailed {
        /// The benchmark that produced no result.
        benchmark: String,

        /// What went wrong in each fork, in fork order.
        failures: Vec<ForkFailure>,
    },
}

impl Error {
    pub(crate) fn configuration(problem: impl Into<String>) -> Self {
        Self::Configuration {
            problem: problem.into(),
        }
    }

    pub(crate) fn channel(reason: impl Into<String>) -> Self {
        Self::Channel {
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for lockstep operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Phase;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn payload_error_names_the_thread() {
        let error = Error::Payload {
            thread: "pong#1".to_string(),
            stage: Stage::Iteration {
                phase: Phase::Measurement,
                index: 3,
            },
            message: "boom".to_string(),
        };

        let text = error.to_string();
        assert!(text.contains("pong#1"));
        assert!(text.contains("measurement iteration 3"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn all_forks_failed_counts_failures() {
        let error = Error::AllForksFailed {
            benchmark: "queue".to_string(),
            failures: Vec::new(),
        };

        assert_eq!(error.to_string(), "all 0 forks of benchmark 'queue' failed");
    }
}
