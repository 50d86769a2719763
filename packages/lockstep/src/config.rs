use std::num::NonZero;
use std::time::Duration;

use new_zealand::nz;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{Error, PhaseSpec};

const DEFAULT_WARMUP_ITERATIONS: u32 = 3;
const DEFAULT_MEASUREMENT_ITERATIONS: u32 = 5;
const DEFAULT_ITERATION_TIME: Duration = Duration::from_secs(1);
const DEFAULT_FORKS: u32 = 1;
const DEFAULT_ITERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SAMPLE_CAPACITY: NonZero<usize> = nz!(65_536);

/// What happens to a measurement iteration in which some worker threads failed, when the run
/// is not configured to fail on any error.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartialFailurePolicy {
    /// Abandon the fork. Iterations already collected are kept in the fork failure record but
    /// do not contribute to the benchmark result.
    #[default]
    AbortFork,

    /// Drop the whole iteration and continue with the next one.
    SkipIteration,

    /// Keep the contributions of the threads that completed cleanly and mark the result as
    /// having degraded confidence.
    ///
    /// A failing thread stops the iteration for every thread, so that no thread keeps waiting
    /// on a partner that is gone. The clean threads therefore contribute the invocations they
    /// completed up to that point, which for count targets may be fewer than the target.
    DiscardFailedThreads,
}

/// Run-wide settings that apply to every benchmark unless the benchmark overrides them.
///
/// Build with [`RunConfig::builder()`] or load from TOML with
/// [`RunConfig::from_toml_str()`]. The defaults are 3 warmup and 5 measurement iterations of
/// 1 second each, in 1 forked worker process.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockstep::{PartialFailurePolicy, PhaseSpec, RunConfig};
///
/// let config = RunConfig::builder()
///     .warmup(PhaseSpec::timed(1, Duration::from_millis(100)))
///     .measurement(PhaseSpec::timed(3, Duration::from_millis(100)))
///     .forks(2)
///     .partial_failure(PartialFailurePolicy::SkipIteration)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.forks(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    warmup: PhaseSpec,
    measurement: PhaseSpec,
    forks: u32,
    threads: Option<NonZero<usize>>,
    iteration_timeout: Duration,
    handshake_timeout: Duration,
    run_timeout: Option<Duration>,
    fail_on_error: bool,
    partial_failure: PartialFailurePolicy,
    sample_capacity: NonZero<usize>,
}

impl RunConfig {
    /// Starts building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parses a configuration from TOML text. Keys that are absent keep their defaults.
    ///
    /// ```toml
    /// forks = 2
    /// threads = 4
    /// fail-on-error = false
    /// partial-failure = "discard-failed-threads"
    /// iteration-timeout = "2m"
    /// run-timeout = "10m"
    ///
    /// [warmup]
    /// iterations = 2
    /// time = "500ms"
    ///
    /// [measurement]
    /// iterations = 5
    /// count = 10000
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the text is not valid TOML, contains unknown keys,
    /// has malformed durations or describes an invalid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("malformed configuration: {e}")))?;

        let mut builder = Self::builder();

        if let Some(warmup) = file.warmup {
            builder = builder.warmup(warmup.into_phase_spec("warmup")?);
        }
        if let Some(measurement) = file.measurement {
            builder = builder.measurement(measurement.into_phase_spec("measurement")?);
        }
        if let Some(forks) = file.forks {
            builder = builder.forks(forks);
        }
        if let Some(threads) = file.threads {
            builder = builder.threads(threads);
        }
        if let Some(timeout) = file.iteration_timeout {
            builder = builder.iteration_timeout(parse_duration(&timeout)?);
        }
        if let Some(timeout) = file.handshake_timeout {
            builder = builder.handshake_timeout(parse_duration(&timeout)?);
        }
        if let Some(timeout) = file.run_timeout {
            builder = builder.run_timeout(parse_duration(&timeout)?);
        }
        if let Some(fail_on_error) = file.fail_on_error {
            builder = builder.fail_on_error(fail_on_error);
        }
        if let Some(policy) = file.partial_failure {
            builder = builder.partial_failure(policy);
        }
        if let Some(capacity) = file.sample_capacity {
            builder = builder.sample_capacity(capacity);
        }

        builder.build()
    }

    /// Warmup phase applied to benchmarks that do not override it.
    #[must_use]
    pub fn warmup(&self) -> PhaseSpec {
        self.warmup
    }

    /// Measurement phase applied to benchmarks that do not override it.
    #[must_use]
    pub fn measurement(&self) -> PhaseSpec {
        self.measurement
    }

    /// Number of worker processes each benchmark runs in, one after another. Zero runs the
    /// benchmark in the calling process without isolation.
    #[must_use]
    pub fn forks(&self) -> u32 {
        self.forks
    }

    /// Thread count that replaces the declared thread count of single-group benchmarks.
    #[must_use]
    pub fn threads(&self) -> Option<NonZero<usize>> {
        self.threads
    }

    /// How long an iteration may run past its target before its threads are considered hung.
    #[must_use]
    pub fn iteration_timeout(&self) -> Duration {
        self.iteration_timeout
    }

    /// How long a worker process may take to connect and select its benchmark.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Upper bound on the lifetime of one fork, after which its worker process is killed.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout
    }

    /// Whether any failure aborts the whole run immediately.
    #[must_use]
    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    /// What happens to iterations in which some threads failed.
    #[must_use]
    pub fn partial_failure(&self) -> PartialFailurePolicy {
        self.partial_failure
    }

    /// Maximum number of latency samples each thread retains per iteration in
    /// [`Mode::SampleTime`][crate::Mode::SampleTime].
    #[must_use]
    pub fn sample_capacity(&self) -> NonZero<usize> {
        self.sample_capacity
    }

    fn validate(&self) -> Result<()> {
        if self.measurement.iterations() == 0 {
            return Err(Error::configuration(
                "at least one measurement iteration is required",
            ));
        }

        if self.iteration_timeout.is_zero() {
            return Err(Error::configuration("iteration timeout must be positive"));
        }

        if self.handshake_timeout.is_zero() {
            return Err(Error::configuration("handshake timeout must be positive"));
        }

        if self.run_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::configuration("run timeout must be positive"));
        }

        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            warmup: PhaseSpec::timed(DEFAULT_WARMUP_ITERATIONS, DEFAULT_ITERATION_TIME),
            measurement: PhaseSpec::timed(DEFAULT_MEASUREMENT_ITERATIONS, DEFAULT_ITERATION_TIME),
            forks: DEFAULT_FORKS,
            threads: None,
            iteration_timeout: DEFAULT_ITERATION_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            run_timeout: None,
            fail_on_error: false,
            partial_failure: PartialFailurePolicy::default(),
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
        }
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug)]
#[must_use]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Sets the warmup phase.
    pub fn warmup(mut self, warmup: PhaseSpec) -> Self {
        self.config.warmup = warmup;
        self
    }

    /// Sets the measurement phase.
    pub fn measurement(mut self, measurement: PhaseSpec) -> Self {
        self.config.measurement = measurement;
        self
    }

    /// Sets the number of worker processes per benchmark. Zero runs in-process.
    pub fn forks(mut self, forks: u32) -> Self {
        self.config.forks = forks;
        self
    }

    /// Overrides the thread count of single-group benchmarks.
    pub fn threads(mut self, threads: NonZero<usize>) -> Self {
        self.config.threads = Some(threads);
        self
    }

    /// Sets how long an iteration may overrun its target before it is considered hung.
    pub fn iteration_timeout(mut self, timeout: Duration) -> Self {
        self.config.iteration_timeout = timeout;
        self
    }

    /// Sets how long a worker process may take to connect and select its benchmark.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets the upper bound on the lifetime of one fork.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = Some(timeout);
        self
    }

    /// Sets whether any failure aborts the whole run.
    pub fn fail_on_error(mut self, fail_on_error: bool) -> Self {
        self.config.fail_on_error = fail_on_error;
        self
    }

    /// Sets what happens to iterations in which some threads failed.
    pub fn partial_failure(mut self, policy: PartialFailurePolicy) -> Self {
        self.config.partial_failure = policy;
        self
    }

    /// Sets the per-thread sample buffer capacity of sample-based modes.
    pub fn sample_capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.config.sample_capacity = capacity;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if there are no measurement iterations or a timeout
    /// is zero.
    pub fn build(self) -> Result<RunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigFile {
    warmup: Option<PhaseFile>,
    measurement: Option<PhaseFile>,
    forks: Option<u32>,
    threads: Option<NonZero<usize>>,
    iteration_timeout: Option<String>,
    handshake_timeout: Option<String>,
    run_timeout: Option<String>,
    fail_on_error: Option<bool>,
    partial_failure: Option<PartialFailurePolicy>,
    sample_capacity: Option<NonZero<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PhaseFile {
    iterations: u32,
    time: Option<String>,
    count: Option<u64>,
}

impl PhaseFile {
    fn into_phase_spec(self, section: &str) -> Result<PhaseSpec> {
        match (self.time, self.count) {
            (Some(time), None) => Ok(PhaseSpec::timed(self.iterations, parse_duration(&time)?)),
            (None, Some(count)) => Ok(PhaseSpec::counted(self.iterations, count)),
            _ => Err(Error::configuration(format!(
                "[{section}] must set exactly one of 'time' and 'count'"
            ))),
        }
    }
}

/// Parses a human-readable duration such as `500ms`, `1.5s` or `2m`. A bare number is seconds.
pub(crate) fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();

    if text.is_empty() {
        return Err(Error::configuration("empty duration"));
    }

    let (number, unit) = text
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map_or((text, ""), |(i, _)| text.split_at(i));

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid duration number in '{text}'")))?;

    if !value.is_finite() || value < 0.0 {
        return Err(Error::configuration(format!(
            "duration '{text}' must be a non-negative number"
        )));
    }

    let nanos_per_unit = match unit {
        "ns" => 1.0,
        "us" | "µs" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" | "" => 1_000_000_000.0,
        "m" | "min" => 60_000_000_000.0,
        _ => {
            return Err(Error::configuration(format!(
                "unknown duration unit '{unit}' in '{text}'"
            )));
        }
    };

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is finite and non-negative, sub-nanosecond precision is not meaningful"
    )]
    let nanos = (value * nanos_per_unit) as u64;

    Ok(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IterationTarget;

    #[test]
    fn defaults_are_valid() {
        let config = RunConfig::builder().build().unwrap();

        assert_eq!(config, RunConfig::default());
        assert_eq!(config.forks(), 1);
        assert_eq!(config.warmup().iterations(), 3);
        assert_eq!(config.measurement().iterations(), 5);
        assert_eq!(config.partial_failure(), PartialFailurePolicy::AbortFork);
        assert!(!config.fail_on_error());
    }

    #[test]
    fn zero_measurement_iterations_is_rejected() {
        let result = RunConfig::builder()
            .measurement(PhaseSpec::counted(0, 10))
            .build();

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn zero_warmup_iterations_is_allowed() {
        let config = RunConfig::builder()
            .warmup(PhaseSpec::counted(0, 10))
            .build()
            .unwrap();

        assert_eq!(config.warmup().iterations(), 0);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        assert!(
            RunConfig::builder()
                .iteration_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(
            RunConfig::builder()
                .run_timeout(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("250ns").unwrap(), Duration::from_nanos(250));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3h").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn loads_from_toml() {
        let config = RunConfig::from_toml_str(
            r#"
            forks = 0
            threads = 4
            fail-on-error = true
            partial-failure = "discard-failed-threads"
            iteration-timeout = "2m"
            run-timeout = "10m"

            [warmup]
            iterations = 2
            time = "500ms"

            [measurement]
            iterations = 7
            count = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.forks(), 0);
        assert_eq!(config.threads(), Some(nz!(4)));
        assert!(config.fail_on_error());
        assert_eq!(
            config.partial_failure(),
            PartialFailurePolicy::DiscardFailedThreads
        );
        assert_eq!(config.iteration_timeout(), Duration::from_secs(120));
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(
            config.warmup().target(),
            IterationTarget::Duration(Duration::from_millis(500))
        );
        assert_eq!(config.measurement().iterations(), 7);
        assert_eq!(config.measurement().target(), IterationTarget::Count(1000));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(RunConfig::from_toml_str("").unwrap(), RunConfig::default());
    }

    #[test]
    fn toml_phase_needs_exactly_one_target() {
        let both = RunConfig::from_toml_str(
            r#"
            [measurement]
            iterations = 1
            time = "1s"
            count = 5
            "#,
        );
        assert!(matches!(both, Err(Error::Configuration { .. })));

        let neither = RunConfig::from_toml_str(
            r"
            [measurement]
            iterations = 1
            ",
        );
        assert!(matches!(neither, Err(Error::Configuration { .. })));
    }

    #[test]
    fn toml_unknown_key_is_rejected() {
        let result = RunConfig::from_toml_str("speed = 11");

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
