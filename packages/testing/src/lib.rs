#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the lockstep workspace.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How long [`with_watchdog()`] lets a test run.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a test with a timeout to prevent infinite hangs.
///
/// This function wraps a test closure with a timeout mechanism. If the test
/// takes longer than 10 seconds to complete, the calling thread panics
/// so that CI/build systems do not hang.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     // Your test code here
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    with_watchdog_timeout(DEFAULT_WATCHDOG_TIMEOUT, test_fn)
}

/// Same as [`with_watchdog()`] but with a custom timeout, for tests that run
/// real benchmark phases and legitimately take a while.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
pub fn with_watchdog_timeout<F, R>(timeout: Duration, test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Check if we are running under mutation testing.
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        // Under mutation testing, disable the watchdog to allow hanging mutations.
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has timed out.
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Calculates the difference between two f64 values and considers
/// them equal if the difference is not more than `close_enough`.
///
/// This is a "correctly performed" floating point equality comparison.
#[must_use]
pub fn f64_diff_abs(a: f64, b: f64, close_enough: f64) -> f64 {
    let diff = (a - b).abs();

    if diff <= close_enough { 0.0 } else { diff }
}

/// Counts invocations per key, shared between a test and the payloads it runs.
///
/// Clones share the same log, so a test can hand a clone to every payload and inspect the
/// counts afterwards without any process-wide state.
///
/// ```rust
/// use testing::InvocationLog;
///
/// let log = InvocationLog::new();
/// let handle = log.clone();
///
/// handle.record("pong#0");
/// handle.record("pong#0");
///
/// assert_eq!(log.count("pong#0"), 2);
/// assert_eq!(log.count("ping#0"), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InvocationLog {
    counts: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl InvocationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation under `key`.
    ///
    /// # Panics
    ///
    /// Panics if another thread panicked while recording.
    pub fn record(&self, key: &str) {
        let mut counts = self.counts.lock().expect("invocation log lock poisoned");
        let count = counts.entry(key.to_string()).or_default();
        *count = count.saturating_add(1);
    }

    /// Number of invocations recorded under `key`.
    ///
    /// # Panics
    ///
    /// Panics if another thread panicked while recording.
    #[must_use]
    pub fn count(&self, key: &str) -> u64 {
        self.counts
            .lock()
            .expect("invocation log lock poisoned")
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Number of invocations recorded under any key.
    ///
    /// # Panics
    ///
    /// Panics if another thread panicked while recording.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts
            .lock()
            .expect("invocation log lock poisoned")
            .values()
            .fold(0, |acc, count| acc.saturating_add(*count))
    }

    /// Every key with at least one recorded invocation, in ascending order.
    ///
    /// # Panics
    ///
    /// Panics if another thread panicked while recording.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.counts
            .lock()
            .expect("invocation log lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
