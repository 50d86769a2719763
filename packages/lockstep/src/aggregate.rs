use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{Mode, RawResult, TimeUnit};

/// Percentiles reported for percentile-based modes, keyed by their label.
const REPORTED_PERCENTILES: [(&str, f64); 7] = [
    ("p50", 50.0),
    ("p90", 90.0),
    ("p95", 95.0),
    ("p99", 99.0),
    ("p99.9", 99.9),
    ("p99.99", 99.99),
    ("p100", 100.0),
];

/// Exact running totals from which every score is derived.
///
/// Combining two accumulators only adds integers and merges sorted sample sequences, so the
/// combination is associative and commutative: combining per-thread results into an iteration,
/// iterations into a fork and forks into a run all apply the same rule and arrive at the same
/// totals regardless of order or grouping.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    ops: u64,
    elapsed_nanos: u64,
    thread_iterations: u64,
    iterations: u64,
    samples: Vec<u64>,
}

impl Accumulator {
    /// Combines the clean per-thread results of one iteration.
    pub(crate) fn from_iteration<'a>(results: impl IntoIterator<Item = &'a RawResult>) -> Self {
        let mut accumulator = Self::default();

        for result in results {
            accumulator.ops = accumulator
                .ops
                .checked_add(result.ops())
                .expect("operation count overflows u64 - this indicates an unrealistic scenario");
            accumulator.elapsed_nanos = accumulator
                .elapsed_nanos
                .checked_add(duration_nanos(result.elapsed()))
                .expect("elapsed time overflows u64 nanoseconds - this indicates an unrealistic scenario");
            accumulator.thread_iterations = accumulator.thread_iterations.saturating_add(1);
            accumulator.samples.extend_from_slice(result.samples());
        }

        if accumulator.thread_iterations > 0 {
            accumulator.iterations = 1;
        }

        accumulator.samples.sort_unstable();
        accumulator
    }

    /// Combines two accumulators.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            ops: self
                .ops
                .checked_add(other.ops)
                .expect("operation count overflows u64 - this indicates an unrealistic scenario"),
            elapsed_nanos: self.elapsed_nanos.checked_add(other.elapsed_nanos).expect(
                "elapsed time overflows u64 nanoseconds - this indicates an unrealistic scenario",
            ),
            thread_iterations: self
                .thread_iterations
                .checked_add(other.thread_iterations)
                .expect("thread iteration count overflows u64 - this indicates an unrealistic scenario"),
            iterations: self
                .iterations
                .checked_add(other.iterations)
                .expect("iteration count overflows u64 - this indicates an unrealistic scenario"),
            samples: self
                .samples
                .iter()
                .copied()
                .merge(other.samples.iter().copied())
                .collect(),
        }
    }

    /// Combines the accumulators of disjoint sets of threads that ran the same iteration.
    pub(crate) fn concurrent<'a>(parts: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut combined = parts
            .into_iter()
            .fold(Self::default(), |combined, part| combined.merge(part));

        combined.iterations = u64::from(combined.thread_iterations > 0);
        combined
    }

    /// Total payload invocations.
    #[must_use]
    pub fn ops(&self) -> u64 {
        self.ops
    }

    /// Sum of the elapsed time of every thread in every iteration.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos)
    }

    /// Number of (thread, iteration) pairs that contributed.
    #[must_use]
    pub fn thread_iterations(&self) -> u64 {
        self.thread_iterations
    }

    /// Number of iterations that contributed.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Every retained latency sample in nanoseconds, in ascending order.
    #[must_use]
    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    /// The score of the given mode, in the given time unit.
    ///
    /// Returns NaN if the accumulator holds nothing the score can be derived from (e.g. no
    /// operations for an average time).
    #[expect(
        clippy::cast_precision_loss,
        reason = "scores are floating point by nature, totals beyond 2^53 lose only insignificant digits"
    )]
    pub(crate) fn score(&self, mode: Mode, unit: TimeUnit, score_percentile: f64) -> f64 {
        match mode {
            Mode::Throughput => {
                if self.elapsed_nanos == 0 || self.iterations == 0 {
                    return f64::NAN;
                }

                // Dividing by summed thread time yields the mean per-thread rate; scaling by the
                // mean concurrency turns it into the combined rate of all threads.
                let per_thread = self.ops as f64 / (self.elapsed_nanos as f64 / unit.nanos());
                let concurrency = self.thread_iterations as f64 / self.iterations as f64;

                per_thread * concurrency
            }
            Mode::AverageTime => {
                if self.ops == 0 {
                    return f64::NAN;
                }

                self.elapsed_nanos as f64 / unit.nanos() / self.ops as f64
            }
            Mode::SampleTime | Mode::SingleShotTime => nearest_rank(&self.samples, score_percentile)
                .map_or(f64::NAN, |nanos| nanos as f64 / unit.nanos()),
        }
    }

    /// The standard percentiles of the samples, in the given time unit.
    #[expect(
        clippy::cast_precision_loss,
        reason = "sample values beyond 2^53 nanoseconds lose only insignificant digits"
    )]
    pub(crate) fn percentiles(&self, unit: TimeUnit) -> BTreeMap<String, f64> {
        REPORTED_PERCENTILES
            .iter()
            .filter_map(|(label, percentile)| {
                nearest_rank(&self.samples, *percentile)
                    .map(|nanos| ((*label).to_string(), nanos as f64 / unit.nanos()))
            })
            .collect()
    }
}

/// Nearest-rank percentile over ascending samples: the smallest sample such that at least
/// `percentile` percent of all samples are less than or equal to it.
///
/// The percentile is resolved to a hundredth of a percent so that the rank is computed with
/// integer arithmetic and is identical for identical inputs.
pub(crate) fn nearest_rank(sorted: &[u64], percentile: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "percentile is validated to 0..=100, so the value fits in 0..=10_000"
    )]
    let basis_points = (percentile.clamp(0.0, 100.0) * 100.0).round() as u128;

    let count = sorted.len() as u128;
    let rank = basis_points
        .checked_mul(count)
        .expect("10_000 times a slice length fits in u128")
        .div_ceil(10_000);

    let index = usize::try_from(rank.clamp(1, count) - 1)
        .expect("index is below the slice length, which is a usize");

    sorted.get(index).copied()
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Why a worker thread did not contribute to an iteration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThreadFailure {
    thread: String,
    group: String,
    message: String,
}

impl ThreadFailure {
    pub(crate) fn new(thread: String, group: String, message: String) -> Self {
        Self {
            thread,
            group,
            message,
        }
    }

    /// Label of the failed thread, in `group#index` form.
    #[must_use]
    pub fn thread(&self) -> &str {
        &self.thread
    }

    /// Name of the failed thread's group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The panic message or other description of the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The combination of every clean thread's contribution to one measurement iteration.
///
/// Produced exactly once per measurement iteration and never for warmup iterations. The totals
/// are derived from the per-group breakdown, so only the groups are serialized.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "AggregatedParts")]
pub struct AggregatedResult {
    index: u32,
    #[serde(skip)]
    totals: Accumulator,
    groups: BTreeMap<String, Accumulator>,
    clean_threads: usize,
    failed_threads: Vec<String>,
}

#[derive(Deserialize)]
struct AggregatedParts {
    index: u32,
    groups: BTreeMap<String, Accumulator>,
    clean_threads: usize,
    failed_threads: Vec<String>,
}

impl From<AggregatedParts> for AggregatedResult {
    fn from(parts: AggregatedParts) -> Self {
        Self {
            index: parts.index,
            totals: Accumulator::concurrent(parts.groups.values()),
            groups: parts.groups,
            clean_threads: parts.clean_threads,
            failed_threads: parts.failed_threads,
        }
    }
}

impl AggregatedResult {
    /// Combines the per-thread results of iteration `index`.
    ///
    /// `active_groups` lists every group that had threads in the iteration, so that a group whose
    /// threads all failed still appears in the breakdown.
    pub(crate) fn from_reports(
        index: u32,
        active_groups: &[Arc<str>],
        completed: &[(Arc<str>, RawResult)],
        failures: &[ThreadFailure],
    ) -> Self {
        AggregatedParts {
            index,
            groups: active_groups
                .iter()
                .map(|group| {
                    let accumulator = Accumulator::from_iteration(
                        completed
                            .iter()
                            .filter(|(g, _)| g == group)
                            .map(|(_, raw)| raw),
                    );

                    (group.to_string(), accumulator)
                })
                .collect(),
            clean_threads: completed.len(),
            failed_threads: failures.iter().map(|f| f.thread.clone()).collect(),
        }
        .into()
    }

    /// Moves the samples of every group out, leaving accumulators without samples behind.
    ///
    /// Groups without samples are not listed.
    pub(crate) fn take_samples(&mut self) -> Vec<(String, Vec<u64>)> {
        self.totals.samples = Vec::new();

        self.groups
            .iter_mut()
            .filter(|(_, accumulator)| !accumulator.samples.is_empty())
            .map(|(group, accumulator)| (group.clone(), mem::take(&mut accumulator.samples)))
            .collect()
    }

    /// Puts samples taken with [`take_samples()`][Self::take_samples] back and re-derives the
    /// totals.
    ///
    /// Returns a description of the problem if the samples cannot belong to this iteration.
    pub(crate) fn restore_samples(
        &mut self,
        samples: BTreeMap<String, Vec<u64>>,
    ) -> std::result::Result<(), String> {
        for (group, samples) in samples {
            let Some(accumulator) = self.groups.get_mut(&group) else {
                return Err(format!("samples for unknown group '{group}'"));
            };

            if !samples.is_sorted() {
                return Err(format!("samples of group '{group}' are not in ascending order"));
            }

            accumulator.samples = samples;
        }

        self.totals = Accumulator::concurrent(self.groups.values());
        Ok(())
    }

    /// Index of the measurement iteration.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Totals across all clean threads.
    #[must_use]
    pub fn totals(&self) -> &Accumulator {
        &self.totals
    }

    /// Totals per group, keyed by group name.
    #[must_use]
    pub fn groups(&self) -> &BTreeMap<String, Accumulator> {
        &self.groups
    }

    /// Number of threads that completed the iteration cleanly.
    #[must_use]
    pub fn clean_threads(&self) -> usize {
        self.clean_threads
    }

    /// Labels of the threads that failed during the iteration.
    #[must_use]
    pub fn failed_threads(&self) -> &[String] {
        &self.failed_threads
    }

    /// Whether every thread completed the iteration cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed_threads.is_empty()
    }
}
