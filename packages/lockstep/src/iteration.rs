use std::num::NonZero;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{Blackhole, Control, IterationTarget, Mode, PayloadKind};

/// What one worker thread produced during one iteration.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    ops: u64,
    elapsed: Duration,
    samples: Vec<u64>,
}

impl RawResult {
    pub(crate) fn new(ops: u64, elapsed: Duration, samples: Vec<u64>) -> Self {
        Self {
            ops,
            elapsed,
            samples,
        }
    }

    /// Number of payload invocations that completed.
    #[must_use]
    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// Time from the iteration's release until the thread stopped invoking the payload.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Individual timings in nanoseconds, in the order they were taken. Only populated in
    /// sample-based modes.
    #[must_use]
    pub fn samples(&self) -> &[u64] {
        &self.samples
    }
}

/// Where an [`IterationLoop`] is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LoopState {
    /// Waiting for the iteration start signal.
    Idle,

    /// Invoking the payload.
    Running,

    /// Stop observed or count exhausted; the last invocation has completed.
    Draining,

    /// The raw result has been recorded.
    Done,
}

/// Drives one worker thread's payload through one iteration.
#[derive(Debug)]
pub(crate) struct IterationLoop<'a> {
    payload: &'a mut PayloadKind,
    blackhole: &'a mut Blackhole,
    mode: Mode,
    sample_capacity: NonZero<usize>,
    state: LoopState,
}

impl<'a> IterationLoop<'a> {
    pub(crate) fn new(
        payload: &'a mut PayloadKind,
        blackhole: &'a mut Blackhole,
        mode: Mode,
        sample_capacity: NonZero<usize>,
    ) -> Self {
        Self {
            payload,
            blackhole,
            mode,
            sample_capacity,
            state: LoopState::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> LoopState {
        self.state
    }

    /// Runs the iteration to completion. `released_at` is the instant the iteration started,
    /// which every elapsed time is measured from.
    ///
    /// For count targets, the payload is invoked exactly the target number of times unless a
    /// stop is requested first. For duration targets, invocations continue until a stop is
    /// requested. No invocation starts after a stop has been observed.
    pub(crate) fn run(&mut self, control: &Control, released_at: Instant) -> RawResult {
        assert_eq!(self.state, LoopState::Idle, "an iteration loop runs only once");
        self.state = LoopState::Running;

        let limit = match control.params().target() {
            IterationTarget::Count(count) => count,
            IterationTarget::Duration(_) => u64::MAX,
        };

        let blackhole = &mut *self.blackhole;
        let (ops, samples) = match &mut *self.payload {
            PayloadKind::Void(f) => drive(
                |c, _| f(c),
                blackhole,
                control,
                limit,
                self.mode,
                self.sample_capacity,
            ),
            PayloadKind::Returning(f) | PayloadKind::Sink(f) => drive(
                |c, b| f(c, b),
                blackhole,
                control,
                limit,
                self.mode,
                self.sample_capacity,
            ),
        };

        self.state = LoopState::Draining;
        let elapsed = released_at.elapsed();

        let samples = if self.mode == Mode::SingleShotTime {
            vec![duration_nanos(elapsed)]
        } else {
            samples
        };

        self.state = LoopState::Done;
        RawResult::new(ops, elapsed, samples)
    }
}

/// The hot loop, monomorphized per invocation shape.
#[inline]
fn drive<F>(
    mut invoke: F,
    blackhole: &mut Blackhole,
    control: &Control,
    limit: u64,
    mode: Mode,
    sample_capacity: NonZero<usize>,
) -> (u64, Vec<u64>)
where
    F: FnMut(&Control, &mut Blackhole),
{
    let mut ops: u64 = 0;

    if mode == Mode::SampleTime {
        let mut sampler = Sampler::new(sample_capacity);

        while ops < limit && !control.should_stop() {
            if sampler.should_sample(ops) {
                let start = Instant::now();
                invoke(control, blackhole);
                sampler.record(duration_nanos(start.elapsed()));
            } else {
                invoke(control, blackhole);
            }

            ops = ops.wrapping_add(1);
        }

        (ops, sampler.into_samples())
    } else {
        while ops < limit && !control.should_stop() {
            invoke(control, blackhole);
            ops = ops.wrapping_add(1);
        }

        (ops, Vec::new())
    }
}

/// Bounded buffer of per-invocation timings.
///
/// When the buffer fills up, every other retained sample is dropped and the sampling stride
/// doubles, so the retained samples stay evenly spread over the whole iteration.
#[derive(Debug)]
struct Sampler {
    samples: Vec<u64>,
    capacity: NonZero<usize>,
    stride: u64,
}

impl Sampler {
    fn new(capacity: NonZero<usize>) -> Self {
        Self {
            samples: Vec::new(),
            capacity,
            stride: 1,
        }
    }

    #[inline]
    fn should_sample(&self, invocation: u64) -> bool {
        // Stride is always a power of two.
        invocation & (self.stride.wrapping_sub(1)) == 0
    }

    fn record(&mut self, nanos: u64) {
        self.samples.push(nanos);

        if self.samples.len() >= self.capacity.get() && self.samples.len() > 1 {
            let mut index = 0_usize;
            self.samples.retain(|_| {
                let keep = index % 2 == 0;
                index = index.wrapping_add(1);
                keep
            });

            self.stride = self
                .stride
                .checked_mul(2)
                .expect("stride cannot exceed 2^63 - there are not that many invocations");
        }
    }

    fn into_samples(self) -> Vec<u64> {
        self.samples
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    // u64 nanoseconds cover 584 years.
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
