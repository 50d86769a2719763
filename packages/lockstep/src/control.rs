use std::sync::atomic::{AtomicBool, Ordering};

use crate::IterationParams;

/// Cooperative stop signal shared by every thread participating in one iteration.
///
/// The flag starts clear and is set at most once per iteration, either by the iteration timer
/// when a duration target elapses or by the coordinator when the iteration is cancelled.
/// Setting it never interrupts a payload invocation that is already running; the harness
/// simply does not start another one. Payloads that loop internally (e.g. a consumer waiting
/// for a producer) should poll [`should_stop()`][Self::should_stop] to exit promptly.
///
/// # Examples
///
/// ```
/// use lockstep::{Control, IterationParams, IterationTarget, Phase};
///
/// let control = Control::new(IterationParams::new(
///     Phase::Measurement,
///     0,
///     IterationTarget::Count(10),
/// ));
///
/// assert!(!control.should_stop());
/// assert!(control.request_stop());
/// assert!(!control.request_stop()); // Already set.
/// assert!(control.should_stop());
/// ```
#[derive(Debug)]
pub struct Control {
    stop: AtomicBool,
    params: IterationParams,
}

impl Control {
    /// Creates a clear control for the iteration described by `params`.
    #[must_use]
    pub fn new(params: IterationParams) -> Self {
        Self {
            stop: AtomicBool::new(false),
            params,
        }
    }

    /// Asks every participating thread to stop after its current invocation.
    ///
    /// Returns `true` if this call set the flag, `false` if it was already set.
    pub fn request_stop(&self) -> bool {
        // Release pairs with the Acquire in should_stop() so that anything the writer did
        // before stopping (e.g. a producer publishing its last item) is visible to readers.
        !self.stop.swap(true, Ordering::Release)
    }

    /// Whether a stop has been requested.
    #[inline]
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The iteration this control governs.
    #[must_use]
    pub fn params(&self) -> &IterationParams {
        &self.params
    }
}
