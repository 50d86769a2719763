use std::collections::HashSet;
use std::num::NonZero;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{Error, Payload, PhaseSpec};

/// Name of the group that holds all threads of a benchmark that does not declare groups.
pub const DEFAULT_GROUP: &str = "default";

/// Percentile reported as the score of percentile-based modes unless overridden.
const DEFAULT_SCORE_PERCENTILE: f64 = 50.0;

/// What a benchmark measures and how its score is derived.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Operations completed per unit of time, summed across threads.
    #[default]
    #[display("thrpt")]
    Throughput,

    /// Mean time per operation.
    #[display("avgt")]
    AverageTime,

    /// Distribution of individually timed invocations.
    #[display("sample")]
    SampleTime,

    /// Distribution of whole-batch timings, one per thread per iteration.
    ///
    /// Requires count-targeted iterations.
    #[display("ss")]
    SingleShotTime,
}

impl Mode {
    /// Whether the score is a percentile over a sample distribution.
    #[must_use]
    pub fn is_percentile(self) -> bool {
        matches!(self, Self::SampleTime | Self::SingleShotTime)
    }
}

/// Unit in which time-based scores are reported.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum TimeUnit {
    /// Nanoseconds.
    #[display("ns")]
    Nanoseconds,

    /// Microseconds.
    #[display("us")]
    Microseconds,

    /// Milliseconds.
    #[display("ms")]
    Milliseconds,

    /// Seconds.
    #[default]
    #[display("s")]
    Seconds,
}

impl TimeUnit {
    /// How many nanoseconds one unit spans.
    #[must_use]
    pub fn nanos(self) -> f64 {
        match self {
            Self::Nanoseconds => 1.0,
            Self::Microseconds => 1_000.0,
            Self::Milliseconds => 1_000_000.0,
            Self::Seconds => 1_000_000_000.0,
        }
    }

    /// The unit of a score in the given mode, e.g. `ops/s` or `us/op`.
    #[must_use]
    pub fn score_unit(self, mode: Mode) -> String {
        match mode {
            Mode::Throughput => format!("ops/{self}"),
            Mode::AverageTime | Mode::SampleTime | Mode::SingleShotTime => format!("{self}/op"),
        }
    }
}

/// A named partition of worker threads that share one payload factory.
#[derive(Clone, Debug)]
pub struct ThreadGroup {
    name: Arc<str>,
    threads: usize,
    payload: Payload,
}

impl ThreadGroup {
    /// Name of the group, unique within its benchmark.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many worker threads run the group's payload. Zero means the group is inactive.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn name_shared(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }
}

/// Identifies one operation to measure and everything about how it runs, except for the
/// run-wide settings in [`RunConfig`][crate::RunConfig].
///
/// Build with [`BenchmarkDescriptor::builder()`]. A descriptor is immutable once built.
///
/// # Examples
///
/// ```
/// use lockstep::{BenchmarkDescriptor, Mode, Payload, PayloadKind, TimeUnit};
///
/// let descriptor = BenchmarkDescriptor::builder("queue_handoff")
///     .mode(Mode::AverageTime)
///     .time_unit(TimeUnit::Nanoseconds)
///     .group("producer", 1, Payload::new(|_| PayloadKind::void(|_| {})))
///     .group("consumer", 3, Payload::new(|_| PayloadKind::void(|_| {})))
///     .build()
///     .unwrap();
///
/// assert_eq!(descriptor.total_threads().get(), 4);
/// ```
#[derive(Clone, Debug)]
pub struct BenchmarkDescriptor {
    name: String,
    mode: Mode,
    time_unit: TimeUnit,
    groups: Vec<ThreadGroup>,
    total_threads: NonZero<usize>,
    sync_iterations: bool,
    score_percentile: f64,
    warmup: Option<PhaseSpec>,
    measurement: Option<PhaseSpec>,
    iteration_timeout: Option<Duration>,
}

impl BenchmarkDescriptor {
    /// Starts building a descriptor for the benchmark with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> BenchmarkDescriptorBuilder {
        BenchmarkDescriptorBuilder::new(name.into())
    }

    /// Name of the benchmark, unique within its registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the benchmark measures.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Unit the score is reported in.
    #[must_use]
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Thread groups in declaration order, including inactive (zero-thread) groups.
    #[must_use]
    pub fn groups(&self) -> &[ThreadGroup] {
        &self.groups
    }

    /// Number of worker threads across all groups.
    #[must_use]
    pub fn total_threads(&self) -> NonZero<usize> {
        self.total_threads
    }

    /// Whether every thread of every group is released together at the start of each iteration.
    #[must_use]
    pub fn sync_iterations(&self) -> bool {
        self.sync_iterations
    }

    /// Percentile (0 to 100) reported as the score of percentile-based modes.
    #[must_use]
    pub fn score_percentile(&self) -> f64 {
        self.score_percentile
    }

    /// Warmup phase override for this benchmark.
    #[must_use]
    pub fn warmup(&self) -> Option<PhaseSpec> {
        self.warmup
    }

    /// Measurement phase override for this benchmark.
    #[must_use]
    pub fn measurement(&self) -> Option<PhaseSpec> {
        self.measurement
    }

    /// Per-iteration timeout override for this benchmark.
    #[must_use]
    pub fn iteration_timeout(&self) -> Option<Duration> {
        self.iteration_timeout
    }

    /// Number of groups that have at least one thread.
    #[must_use]
    pub fn active_group_count(&self) -> usize {
        self.groups.iter().filter(|g| g.threads > 0).count()
    }

    /// Returns a copy with the thread count replaced, if the benchmark has a single group.
    ///
    /// Thread distributions across multiple groups are part of the benchmark's definition, so
    /// they are left unchanged and `None` is returned.
    pub(crate) fn with_thread_override(&self, threads: NonZero<usize>) -> Option<Self> {
        let [group] = self.groups.as_slice() else {
            return None;
        };

        let mut clone = self.clone();
        clone.groups = vec![ThreadGroup {
            threads: threads.get(),
            ..group.clone()
        }];
        clone.total_threads = threads;

        Some(clone)
    }
}

/// Builder for [`BenchmarkDescriptor`].
///
/// Declare either a single payload with [`payload()`][Self::payload] (optionally with a
/// thread count from [`threads()`][Self::threads]) or any number of named groups with
/// [`group()`][Self::group]. When both groups and a thread count are declared, the thread count
/// must equal the sum of the group thread counts.
#[derive(Debug)]
#[must_use]
pub struct BenchmarkDescriptorBuilder {
    name: String,
    mode: Mode,
    time_unit: TimeUnit,
    threads: Option<usize>,
    payload: Option<Payload>,
    groups: Vec<(String, usize, Payload)>,
    sync_iterations: bool,
    score_percentile: f64,
    warmup: Option<PhaseSpec>,
    measurement: Option<PhaseSpec>,
    iteration_timeout: Option<Duration>,
}

impl BenchmarkDescriptorBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            mode: Mode::default(),
            time_unit: TimeUnit::default(),
            threads: None,
            payload: None,
            groups: Vec::new(),
            sync_iterations: true,
            score_percentile: DEFAULT_SCORE_PERCENTILE,
            warmup: None,
            measurement: None,
            iteration_timeout: None,
        }
    }

    /// Sets what the benchmark measures. Defaults to [`Mode::Throughput`].
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the unit the score is reported in. Defaults to [`TimeUnit::Seconds`].
    pub fn time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Declares the total number of worker threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets the payload of the single default group.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a named thread group. A group with zero threads is legal and never started.
    pub fn group(mut self, name: impl Into<String>, threads: usize, payload: Payload) -> Self {
        self.groups.push((name.into(), threads, payload));
        self
    }

    /// Sets whether all threads are released together at the start of every iteration.
    /// Defaults to `true`.
    pub fn sync_iterations(mut self, sync: bool) -> Self {
        self.sync_iterations = sync;
        self
    }

    /// Sets the percentile reported as the score of percentile-based modes. Defaults to 50.
    pub fn score_percentile(mut self, percentile: f64) -> Self {
        self.score_percentile = percentile;
        self
    }

    /// Overrides the run-wide warmup phase for this benchmark.
    pub fn warmup(mut self, warmup: PhaseSpec) -> Self {
        self.warmup = Some(warmup);
        self
    }

    /// Overrides the run-wide measurement phase for this benchmark.
    pub fn measurement(mut self, measurement: PhaseSpec) -> Self {
        self.measurement = Some(measurement);
        self
    }

    /// Overrides the run-wide per-iteration timeout for this benchmark.
    pub fn iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    /// Validates the declaration and builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name is empty, no payload is declared, both a
    /// default payload and groups are declared, group names repeat, the benchmark would have
    /// no threads, the declared thread count does not match the groups, or the score
    /// percentile is outside 0 to 100.
    pub fn build(self) -> Result<BenchmarkDescriptor> {
        if self.name.is_empty() {
            return Err(Error::configuration("benchmark name must not be empty"));
        }

        let groups = match (self.payload, self.groups.is_empty()) {
            (Some(_), false) => {
                return Err(Error::configuration(format!(
                    "benchmark '{}' declares both a default payload and named groups",
                    self.name
                )));
            }
            (None, true) => {
                return Err(Error::configuration(format!(
                    "benchmark '{}' declares no payload",
                    self.name
                )));
            }
            (Some(payload), true) => vec![ThreadGroup {
                name: Arc::from(DEFAULT_GROUP),
                threads: self.threads.unwrap_or(1),
                payload,
            }],
            (None, false) => {
                let mut seen = HashSet::new();

                for (name, _, _) in &self.groups {
                    if !seen.insert(name.as_str()) {
                        return Err(Error::configuration(format!(
                            "benchmark '{}' declares group '{name}' more than once",
                            self.name
                        )));
                    }
                }

                let declared_sum: usize = self.groups.iter().map(|(_, threads, _)| threads).sum();

                if let Some(threads) = self.threads {
                    if threads != declared_sum {
                        return Err(Error::configuration(format!(
                            "benchmark '{}' declares {threads} threads but its groups have {declared_sum}",
                            self.name
                        )));
                    }
                }

                self.groups
                    .into_iter()
                    .map(|(name, threads, payload)| ThreadGroup {
                        name: Arc::from(name),
                        threads,
                        payload,
                    })
                    .collect()
            }
        };

        let total_threads = NonZero::new(groups.iter().map(|g| g.threads).sum()).ok_or_else(|| {
            Error::configuration(format!("benchmark '{}' has no threads to run", self.name))
        })?;

        if !(0.0..=100.0).contains(&self.score_percentile) {
            return Err(Error::configuration(format!(
                "score percentile {} of benchmark '{}' is outside 0..=100",
                self.score_percentile, self.name
            )));
        }

        Ok(BenchmarkDescriptor {
            name: self.name,
            mode: self.mode,
            time_unit: self.time_unit,
            groups,
            total_threads,
            sync_iterations: self.sync_iterations,
            score_percentile: self.score_percentile,
            warmup: self.warmup,
            measurement: self.measurement,
            iteration_timeout: self.iteration_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::PayloadKind;

    fn noop() -> Payload {
        Payload::new(|_| PayloadKind::void(|_| {}))
    }

    #[test]
    fn default_payload_gets_one_thread() {
        let descriptor = BenchmarkDescriptor::builder("noop")
            .payload(noop())
            .build()
            .unwrap();

        assert_eq!(descriptor.total_threads(), nz!(1));
        assert_eq!(descriptor.groups().len(), 1);
        assert_eq!(descriptor.groups()[0].name(), DEFAULT_GROUP);
        assert!(descriptor.sync_iterations());
        assert_eq!(descriptor.mode(), Mode::Throughput);
    }

    #[test]
    fn zero_thread_group_is_kept_but_inactive() {
        let descriptor = BenchmarkDescriptor::builder("ping_pong")
            .group("ping", 0, noop())
            .group("pong", 2, noop())
            .build()
            .unwrap();

        assert_eq!(descriptor.total_threads(), nz!(2));
        assert_eq!(descriptor.groups().len(), 2);
        assert_eq!(descriptor.active_group_count(), 1);
    }

    #[test]
    fn all_groups_empty_is_rejected() {
        let result = BenchmarkDescriptor::builder("nothing")
            .group("a", 0, noop())
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn zero_threads_on_default_payload_is_rejected() {
        let result = BenchmarkDescriptor::builder("nothing")
            .threads(0)
            .payload(noop())
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn declared_total_must_match_groups() {
        let result = BenchmarkDescriptor::builder("mismatch")
            .threads(5)
            .group("producer", 1, noop())
            .group("consumer", 3, noop())
            .build();

        let Err(Error::Configuration { problem }) = result else {
            panic!("expected configuration error");
        };
        assert!(problem.contains("declares 5 threads but its groups have 4"));
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let result = BenchmarkDescriptor::builder("dup")
            .group("a", 1, noop())
            .group("a", 1, noop())
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn payload_and_groups_are_exclusive() {
        let result = BenchmarkDescriptor::builder("both")
            .payload(noop())
            .group("a", 1, noop())
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn percentile_out_of_range_is_rejected() {
        let result = BenchmarkDescriptor::builder("p")
            .mode(Mode::SampleTime)
            .score_percentile(100.5)
            .payload(noop())
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn thread_override_only_applies_to_single_group() {
        let single = BenchmarkDescriptor::builder("single")
            .payload(noop())
            .build()
            .unwrap();
        let overridden = single.with_thread_override(nz!(8)).unwrap();
        assert_eq!(overridden.total_threads(), nz!(8));
        assert_eq!(overridden.groups()[0].threads(), 8);

        let grouped = BenchmarkDescriptor::builder("grouped")
            .group("a", 1, noop())
            .group("b", 1, noop())
            .build()
            .unwrap();
        assert!(grouped.with_thread_override(nz!(8)).is_none());
    }

    #[test]
    fn score_units_follow_mode() {
        assert_eq!(TimeUnit::Seconds.score_unit(Mode::Throughput), "ops/s");
        assert_eq!(
            TimeUnit::Microseconds.score_unit(Mode::AverageTime),
            "us/op"
        );
        assert_eq!(
            TimeUnit::Nanoseconds.score_unit(Mode::SampleTime),
            "ns/op"
        );
    }
}
