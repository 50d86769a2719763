use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorSettings, IterationOutcome, ThreadGroupCoordinator};
use crate::error::Result;
use crate::fork::{self, WorkerLaunch, WorkerProcess, WorkerSettings};
use crate::result::Scoring;
use crate::{
    Accumulator, AggregatedResult, BenchResult, BenchmarkDescriptor, BenchmarkRegistry,
    Confidence, Error, IterationParams, IterationTarget, Mode, PartialFailurePolicy, Phase,
    PhaseSpec, RunConfig, ThreadFailure,
};

/// Executes benchmarks according to a [`RunConfig`].
///
/// With a fork count of zero every benchmark runs on worker threads of the current process.
/// Otherwise every benchmark runs once per fork, each time in a freshly launched worker process,
/// one fork after another. The results of the successful forks are combined into one
/// [`BenchResult`] per benchmark.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use lockstep::{
///     BenchmarkDescriptor, BenchmarkRegistry, Payload, PayloadKind, PhaseSpec, RunConfig,
///     Runner,
/// };
///
/// let mut registry = BenchmarkRegistry::new();
/// registry
///     .register(
///         BenchmarkDescriptor::builder("sum")
///             .payload(Payload::new(|_| PayloadKind::returning(|_| (1..100_u64).sum::<u64>())))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// let config = RunConfig::builder()
///     .forks(0)
///     .warmup(PhaseSpec::timed(1, Duration::from_millis(10)))
///     .measurement(PhaseSpec::timed(2, Duration::from_millis(10)))
///     .build()
///     .unwrap();
///
/// let report = Runner::new(config).run(&registry).unwrap();
/// let (name, result) = report.results().next().unwrap();
///
/// assert_eq!(name, "sum");
/// assert!(result.score() > 0.0);
/// ```
#[derive(Debug)]
pub struct Runner {
    config: RunConfig,
    worker_launch: Option<WorkerLaunch>,
}

impl Runner {
    /// Creates a runner that launches the current executable as its worker processes.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            worker_launch: None,
        }
    }

    /// Launches worker processes as described by `launch` instead of re-executing the current
    /// executable.
    #[must_use]
    pub fn worker_launch(mut self, launch: WorkerLaunch) -> Self {
        self.worker_launch = Some(launch);
        self
    }

    /// The configuration the runner applies.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs every benchmark of `registry` in registration order.
    ///
    /// A benchmark that fails does not stop the others from running. Its error is recorded in
    /// the report instead, unless [`RunConfig::fail_on_error()`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] before running anything if any benchmark cannot run
    /// under the configuration. With `fail_on_error`, returns the first failure.
    pub fn run(&self, registry: &BenchmarkRegistry) -> Result<RunReport> {
        self.ensure_supervisor()?;

        let plans = registry
            .iter()
            .map(|descriptor| RunPlan::resolve(descriptor, &self.config))
            .collect::<Result<Vec<_>>>()?;

        let mut report = RunReport::default();

        for plan in &plans {
            match self.execute(plan) {
                Ok(benchmark) => report.benchmarks.push(benchmark),
                Err(error) if self.config.fail_on_error() => return Err(error),
                Err(error) => {
                    warn!(benchmark = plan.descriptor().name(), %error, "benchmark failed");
                    report
                        .failures
                        .push((plan.descriptor().name().to_string(), error));
                }
            }
        }

        Ok(report)
    }

    /// Runs a single benchmark.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the benchmark cannot run under the configuration,
    /// [`Error::AllForksFailed`] if no fork succeeded and, with `fail_on_error`, the first
    /// failure of any fork.
    pub fn run_benchmark(&self, descriptor: &BenchmarkDescriptor) -> Result<BenchmarkReport> {
        self.ensure_supervisor()?;

        let plan = RunPlan::resolve(descriptor, &self.config)?;
        self.execute(&plan)
    }

    fn ensure_supervisor(&self) -> Result<()> {
        if self.config.forks() > 0 && fork::is_worker_process() {
            return Err(Error::configuration(
                "a worker process cannot launch worker processes of its own",
            ));
        }

        Ok(())
    }

    fn execute(&self, plan: &RunPlan) -> Result<BenchmarkReport> {
        let name = plan.descriptor().name();
        let fork_count = self.config.forks().max(1);

        debug!(
            benchmark = name,
            forks = self.config.forks(),
            threads = plan.descriptor().total_threads().get(),
            mode = %plan.descriptor().mode(),
            "running benchmark"
        );

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();

        for fork in 0..fork_count {
            match self.run_fork(plan, fork) {
                Ok(outcome) => {
                    info!(
                        benchmark = name,
                        fork,
                        score = outcome.result.score(),
                        unit = outcome.result.score_unit(),
                        "fork completed"
                    );
                    succeeded.push(outcome);
                }
                Err(failure) => {
                    warn!(benchmark = name, fork, error = %failure.error, "fork failed");

                    if self.config.fail_on_error() {
                        return Err(failure.error);
                    }

                    failures.push(failure);
                }
            }
        }

        let Some(result) = BenchResult::aggregate(succeeded.iter().map(|o| &o.result)) else {
            return Err(Error::AllForksFailed {
                benchmark: name.to_string(),
                failures,
            });
        };

        let mut groups: BTreeMap<String, BenchResult> = BTreeMap::new();
        if plan.descriptor().active_group_count() > 1 {
            for outcome in &succeeded {
                for (group, group_result) in &outcome.groups {
                    groups
                        .entry(group.clone())
                        .and_modify(|existing| *existing = existing.merge(group_result))
                        .or_insert_with(|| group_result.clone());
                }
            }
        }

        Ok(BenchmarkReport {
            name: name.to_string(),
            result,
            groups: groups
                .into_iter()
                .map(|(group, result)| GroupResult {
                    label: format!("{name}:{group}"),
                    group,
                    result,
                })
                .collect(),
            forks: succeeded
                .into_iter()
                .map(|outcome| (outcome.result, outcome.iterations))
                .collect(),
            failures,
        })
    }

    fn run_fork(&self, plan: &RunPlan, fork: u32) -> std::result::Result<ForkOutcome, ForkFailure> {
        let mut collector = ForkCollector::new(plan.scoring());

        let outcome = if self.config.forks() == 0 {
            self.run_in_process(plan, &mut collector)
        } else {
            self.run_in_worker(plan, fork, &mut collector)
        };

        match outcome {
            Ok(()) => collector.finish().map_err(|error| ForkFailure {
                fork,
                error,
                partial: None,
            }),
            Err(error) => Err(ForkFailure {
                fork,
                error,
                partial: collector.result(),
            }),
        }
    }

    fn run_in_process(&self, plan: &RunPlan, collector: &mut ForkCollector) -> Result<()> {
        let mut coordinator = ThreadGroupCoordinator::start(
            plan.descriptor(),
            CoordinatorSettings {
                sample_capacity: self.config.sample_capacity(),
                iteration_timeout: plan.iteration_timeout,
            },
        )?;

        let run_deadline = self.config.run_timeout().map(|timeout| {
            (
                Instant::now()
                    .checked_add(timeout)
                    .expect("run timeout must fit in an Instant"),
                timeout,
            )
        });

        drive(
            &mut coordinator,
            plan,
            &self.config,
            run_deadline,
            collector,
        )
    }

    fn run_in_worker(
        &self,
        plan: &RunPlan,
        fork: u32,
        collector: &mut ForkCollector,
    ) -> Result<()> {
        let launch = match &self.worker_launch {
            Some(launch) => launch.clone(),
            None => WorkerLaunch::current_exe()?,
        };

        let mut worker = WorkerProcess::spawn(
            &launch,
            fork,
            plan.descriptor().name(),
            WorkerSettings {
                threads: self.config.threads(),
                sample_capacity: self.config.sample_capacity(),
                iteration_timeout: plan.iteration_timeout,
            },
            self.config.handshake_timeout(),
            self.config.run_timeout(),
        )?;

        // The worker process enforces the run timeout on every reply.
        drive(&mut worker, plan, &self.config, None, collector)?;

        worker.finish();
        Ok(())
    }
}

/// Something that can execute iterations of one benchmark: worker threads of this process or a
/// worker process.
trait IterationDriver {
    fn thread_count(&self) -> usize;

    fn run_iteration(&mut self, params: IterationParams) -> Result<IterationOutcome>;
}

impl IterationDriver for ThreadGroupCoordinator {
    fn thread_count(&self) -> usize {
        Self::thread_count(self)
    }

    fn run_iteration(&mut self, params: IterationParams) -> Result<IterationOutcome> {
        Self::run_iteration(self, params)
    }
}

impl IterationDriver for WorkerProcess {
    fn thread_count(&self) -> usize {
        Self::thread_count(self)
    }

    fn run_iteration(&mut self, params: IterationParams) -> Result<IterationOutcome> {
        Self::run_iteration(self, params)
    }
}

/// Runs the warmup and measurement phases of one fork, feeding accepted measurement
/// iterations into `collector`.
fn drive(
    driver: &mut impl IterationDriver,
    plan: &RunPlan,
    config: &RunConfig,
    run_deadline: Option<(Instant, Duration)>,
    collector: &mut ForkCollector,
) -> Result<()> {
    let name = plan.descriptor().name();

    debug!(
        benchmark = name,
        threads = driver.thread_count(),
        warmup = plan.warmup.iterations(),
        measurement = plan.measurement.iterations(),
        "driving iterations"
    );

    let phases = [
        (Phase::Warmup, plan.warmup),
        (Phase::Measurement, plan.measurement),
    ];

    for (phase, spec) in phases {
        for index in 0..spec.iterations() {
            if let Some((deadline, timeout)) = run_deadline {
                if Instant::now() >= deadline {
                    return Err(Error::RunTimeout { timeout });
                }
            }

            let outcome = driver.run_iteration(spec.params(phase, index))?;

            if outcome.failures.is_empty() {
                if let Some(measurement) = outcome.measurement {
                    collector.accept(measurement);
                }
                continue;
            }

            let error = failure_error(&outcome.params, &outcome.failures);

            if config.fail_on_error() {
                return Err(error);
            }

            match config.partial_failure() {
                PartialFailurePolicy::AbortFork => return Err(error),
                PartialFailurePolicy::SkipIteration => {
                    warn!(benchmark = name, %error, "skipping iteration with failed threads");
                    if outcome.measurement.is_some() {
                        collector.skip(error);
                    }
                }
                PartialFailurePolicy::DiscardFailedThreads => {
                    warn!(benchmark = name, %error, "discarding failed threads of iteration");
                    if let Some(measurement) = outcome.measurement {
                        collector.accept_partial(measurement, error);
                    }
                }
            }
        }
    }

    Ok(())
}

fn failure_error(params: &IterationParams, failures: &[ThreadFailure]) -> Error {
    let first = failures
        .first()
        .expect("only called for iterations with failures");

    Error::Payload {
        thread: first.thread().to_string(),
        stage: params.stage(),
        message: first.message().to_string(),
    }
}

/// Everything that decides how one benchmark runs, resolved from its descriptor and the
/// run-wide configuration.
#[derive(Debug)]
struct RunPlan<'a> {
    descriptor: &'a BenchmarkDescriptor,

    /// Replaces `descriptor` if the run-wide thread count applies to it.
    overridden: Option<BenchmarkDescriptor>,

    warmup: PhaseSpec,
    measurement: PhaseSpec,
    iteration_timeout: Duration,
}

impl<'a> RunPlan<'a> {
    fn resolve(descriptor: &'a BenchmarkDescriptor, config: &RunConfig) -> Result<Self> {
        let warmup = descriptor.warmup().unwrap_or_else(|| config.warmup());
        let measurement = descriptor
            .measurement()
            .unwrap_or_else(|| config.measurement());
        let iteration_timeout = descriptor
            .iteration_timeout()
            .unwrap_or_else(|| config.iteration_timeout());

        if measurement.iterations() == 0 {
            return Err(Error::configuration(format!(
                "benchmark '{}' has no measurement iterations",
                descriptor.name()
            )));
        }

        if iteration_timeout.is_zero() {
            return Err(Error::configuration(format!(
                "benchmark '{}' has a zero iteration timeout",
                descriptor.name()
            )));
        }

        if descriptor.mode() == Mode::SingleShotTime {
            for spec in [warmup, measurement] {
                if matches!(spec.target(), IterationTarget::Duration(_)) {
                    return Err(Error::configuration(format!(
                        "benchmark '{}' uses single shot time, which needs invocation count targets",
                        descriptor.name()
                    )));
                }
            }
        }

        let overridden = match config.threads() {
            Some(threads) => {
                let overridden = descriptor.with_thread_override(threads);

                if overridden.is_none() {
                    warn!(
                        benchmark = descriptor.name(),
                        threads = threads.get(),
                        "thread count override ignored for benchmark with multiple groups"
                    );
                }

                overridden
            }
            None => None,
        };

        Ok(Self {
            descriptor,
            overridden,
            warmup,
            measurement,
            iteration_timeout,
        })
    }

    fn descriptor(&self) -> &BenchmarkDescriptor {
        self.overridden.as_ref().unwrap_or(self.descriptor)
    }

    fn scoring(&self) -> Scoring {
        let descriptor = self.descriptor();

        Scoring {
            mode: descriptor.mode(),
            time_unit: descriptor.time_unit(),
            score_percentile: descriptor.score_percentile(),
        }
    }
}

/// The measurement iterations one fork has accepted so far.
#[derive(Debug)]
struct ForkCollector {
    scoring: Scoring,
    iterations: Vec<AggregatedResult>,
    discarded_threads: u64,
    skipped_iterations: u64,
    last_rejection: Option<Error>,
}

impl ForkCollector {
    fn new(scoring: Scoring) -> Self {
        Self {
            scoring,
            iterations: Vec::new(),
            discarded_threads: 0,
            skipped_iterations: 0,
            last_rejection: None,
        }
    }

    fn accept(&mut self, iteration: AggregatedResult) {
        self.iterations.push(iteration);
    }

    fn accept_partial(&mut self, iteration: AggregatedResult, error: Error) {
        self.discarded_threads = self
            .discarded_threads
            .saturating_add(iteration.failed_threads().len() as u64);

        if iteration.clean_threads() == 0 {
            self.skip(error);
        } else {
            self.iterations.push(iteration);
        }
    }

    fn skip(&mut self, error: Error) {
        self.skipped_iterations = self.skipped_iterations.saturating_add(1);
        self.last_rejection = Some(error);
    }

    fn confidence(&self) -> Confidence {
        Confidence::degraded(self.discarded_threads, self.skipped_iterations)
    }

    fn combine<'i>(parts: impl IntoIterator<Item = &'i Accumulator>) -> Option<Accumulator> {
        parts.into_iter().fold(None, |acc, next| {
            Some(match acc {
                Some(acc) => acc.merge(next),
                None => next.clone(),
            })
        })
    }

    /// The result of the iterations accepted so far, if any.
    fn result(&self) -> Option<BenchResult> {
        let totals = Self::combine(self.iterations.iter().map(AggregatedResult::totals))?;

        Some(BenchResult::from_accumulator(
            self.scoring,
            totals,
            self.confidence(),
        ))
    }

    /// Turns the collected iterations into the fork's outcome. A fork that did not accept a
    /// single iteration has failed.
    fn finish(self) -> Result<ForkOutcome> {
        let Some(result) = self.result() else {
            return Err(self.last_rejection.unwrap_or_else(|| {
                Error::configuration("fork completed without any measurement iterations")
            }));
        };

        let mut group_totals: BTreeMap<String, Accumulator> = BTreeMap::new();
        for iteration in &self.iterations {
            for (group, accumulator) in iteration.groups() {
                group_totals
                    .entry(group.clone())
                    .and_modify(|existing| *existing = existing.merge(accumulator))
                    .or_insert_with(|| accumulator.clone());
            }
        }

        let confidence = self.confidence();
        let groups = group_totals
            .into_iter()
            .map(|(group, totals)| {
                (
                    group,
                    BenchResult::from_accumulator(self.scoring, totals, confidence),
                )
            })
            .collect();

        Ok(ForkOutcome {
            result,
            groups,
            iterations: self.iterations,
        })
    }
}

#[derive(Debug)]
struct ForkOutcome {
    result: BenchResult,
    groups: BTreeMap<String, BenchResult>,
    iterations: Vec<AggregatedResult>,
}

/// Why one fork of a benchmark did not contribute to its result.
#[derive(Debug)]
pub struct ForkFailure {
    fork: u32,
    error: Error,
    partial: Option<BenchResult>,
}

impl ForkFailure {
    /// Index of the fork, starting from 0.
    #[must_use]
    pub fn fork(&self) -> u32 {
        self.fork
    }

    /// What ended the fork.
    #[must_use]
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The result of the measurement iterations the fork completed before it failed.
    ///
    /// Kept for inspection only. It never contributes to the benchmark's result.
    #[must_use]
    pub fn partial(&self) -> Option<&BenchResult> {
        self.partial.as_ref()
    }
}

#[derive(Debug)]
struct GroupResult {
    group: String,
    label: String,
    result: BenchResult,
}

/// The outcome of one benchmark across all of its forks.
#[derive(Debug)]
pub struct BenchmarkReport {
    name: String,
    result: BenchResult,
    groups: Vec<GroupResult>,
    forks: Vec<(BenchResult, Vec<AggregatedResult>)>,
    failures: Vec<ForkFailure>,
}

impl BenchmarkReport {
    /// Name of the benchmark.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The combined result of every successful fork.
    #[must_use]
    pub fn result(&self) -> &BenchResult {
        &self.result
    }

    /// The result of one group, if the benchmark had more than one active group.
    #[must_use]
    pub fn group_result(&self, group: &str) -> Option<&BenchResult> {
        self.groups
            .iter()
            .find(|g| g.group == group)
            .map(|g| &g.result)
    }

    /// The result of every successful fork, in fork order.
    pub fn fork_results(&self) -> impl Iterator<Item = &BenchResult> {
        self.forks.iter().map(|(result, _)| result)
    }

    /// Every accepted measurement iteration of every successful fork, in execution order.
    pub fn iterations(&self) -> impl Iterator<Item = &AggregatedResult> {
        self.forks.iter().flat_map(|(_, iterations)| iterations)
    }

    /// The forks that failed.
    #[must_use]
    pub fn fork_failures(&self) -> &[ForkFailure] {
        &self.failures
    }

    fn results(&self) -> impl Iterator<Item = (&str, &BenchResult)> {
        std::iter::once((self.name.as_str(), &self.result)).chain(
            self.groups
                .iter()
                .map(|g| (g.label.as_str(), &g.result)),
        )
    }
}

/// The outcome of running every benchmark of a registry.
#[derive(Debug, Default)]
pub struct RunReport {
    benchmarks: Vec<BenchmarkReport>,
    failures: Vec<(String, Error)>,
}

impl RunReport {
    /// Every result in registration order, as `(name, result)` pairs.
    ///
    /// A benchmark with more than one active group is followed by one secondary result per
    /// group, named `benchmark:group`.
    pub fn results(&self) -> impl Iterator<Item = (&str, &BenchResult)> {
        self.benchmarks.iter().flat_map(BenchmarkReport::results)
    }

    /// The report of every benchmark that produced a result.
    #[must_use]
    pub fn benchmarks(&self) -> &[BenchmarkReport] {
        &self.benchmarks
    }

    /// The report of the named benchmark, if it produced a result.
    #[must_use]
    pub fn benchmark(&self, name: &str) -> Option<&BenchmarkReport> {
        self.benchmarks.iter().find(|b| b.name == name)
    }

    /// The benchmarks that produced no result and why.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.failures
            .iter()
            .map(|(name, error)| (name.as_str(), error))
    }

    /// Whether every benchmark produced a result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Payload, PayloadKind};

    assert_impl_all!(Runner: Send, Sync);
    assert_impl_all!(RunReport: Send, Sync);

    fn quick_config() -> crate::RunConfigBuilder {
        RunConfig::builder()
            .forks(0)
            .warmup(PhaseSpec::counted(1, 10))
            .measurement(PhaseSpec::counted(3, 10))
    }

    fn noop(name: &str) -> BenchmarkDescriptor {
        BenchmarkDescriptor::builder(name)
            .payload(Payload::new(|_| PayloadKind::void(|_| {})))
            .build()
            .unwrap()
    }

    /// Panics on thread 0 in the given measurement iterations.
    fn flaky(name: &str, threads: usize, failing: &'static [u32]) -> BenchmarkDescriptor {
        BenchmarkDescriptor::builder(name)
            .threads(threads)
            .payload(Payload::new(move |meta| {
                let faulty = meta.index_in_group() == 0;
                PayloadKind::void(move |control| {
                    let params = control.params();
                    assert!(
                        !(faulty
                            && params.phase() == Phase::Measurement
                            && failing.contains(&params.index())),
                        "flaky payload"
                    );
                })
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn count_targets_are_exact() {
        let config = quick_config().threads(nz!(2)).build().unwrap();

        let report = Runner::new(config).run_benchmark(&noop("exact")).unwrap();

        let accumulator = report.result().accumulator();
        assert_eq!(accumulator.ops(), 3 * 2 * 10);
        assert_eq!(accumulator.iterations(), 3);
        assert_eq!(report.iterations().count(), 3);
        assert_eq!(report.result().confidence(), Confidence::Full);
    }

    #[test]
    fn abort_fork_turns_thread_failure_into_fork_failure() {
        let config = quick_config().build().unwrap();

        let result = Runner::new(config).run_benchmark(&flaky("abort", 2, &[1]));

        let Err(Error::AllForksFailed { failures, .. }) = result else {
            panic!("expected all forks to fail");
        };
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error(), Error::Payload { .. }));

        // The first measurement iteration completed before the failure.
        let partial = failures[0].partial().unwrap();
        assert_eq!(partial.accumulator().iterations(), 1);
    }

    #[test]
    fn fail_on_error_returns_payload_error() {
        let config = quick_config().fail_on_error(true).build().unwrap();

        let result = Runner::new(config).run_benchmark(&flaky("fatal", 2, &[0]));

        assert!(matches!(result, Err(Error::Payload { .. })));
    }

    #[test]
    fn skip_iteration_degrades_confidence() {
        let config = quick_config()
            .partial_failure(PartialFailurePolicy::SkipIteration)
            .build()
            .unwrap();

        let report = Runner::new(config)
            .run_benchmark(&flaky("skip", 2, &[1]))
            .unwrap();

        assert_eq!(report.result().accumulator().iterations(), 2);
        assert_eq!(
            report.result().confidence(),
            Confidence::Degraded {
                discarded_threads: 0,
                skipped_iterations: 1
            }
        );
    }

    #[test]
    fn discard_failed_threads_keeps_clean_threads() {
        let config = quick_config()
            .partial_failure(PartialFailurePolicy::DiscardFailedThreads)
            .build()
            .unwrap();

        let report = Runner::new(config)
            .run_benchmark(&flaky("discard", 2, &[0, 2]))
            .unwrap();

        let accumulator = report.result().accumulator();
        assert_eq!(accumulator.iterations(), 3);
        assert_eq!(accumulator.thread_iterations(), 4);
        assert_eq!(
            report.result().confidence(),
            Confidence::Degraded {
                discarded_threads: 2,
                skipped_iterations: 0
            }
        );
    }

    #[test]
    fn failed_thread_ends_iteration_for_clean_threads() {
        let config = RunConfig::builder()
            .forks(0)
            .warmup(PhaseSpec::counted(0, 1))
            .measurement(PhaseSpec::counted(1, 10))
            .partial_failure(PartialFailurePolicy::DiscardFailedThreads)
            .build()
            .unwrap();

        // Thread 1 waits for the stop that only the failure of thread 0 can bring.
        let descriptor = BenchmarkDescriptor::builder("partner_gone")
            .threads(2)
            .payload(Payload::new(|meta| {
                let faulty = meta.index_in_group() == 0;
                PayloadKind::void(move |control| {
                    assert!(!faulty, "partner failed");

                    while !control.should_stop() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
            }))
            .build()
            .unwrap();

        let report = testing::with_watchdog(move || {
            Runner::new(config).run_benchmark(&descriptor).unwrap()
        });

        let accumulator = report.result().accumulator();
        assert_eq!(accumulator.thread_iterations(), 1);
        assert!(accumulator.ops() <= 1, "ops: {}", accumulator.ops());
        assert_eq!(
            report.result().confidence(),
            Confidence::Degraded {
                discarded_threads: 1,
                skipped_iterations: 0
            }
        );
    }

    #[test]
    fn fork_without_accepted_iterations_fails() {
        let config = quick_config()
            .partial_failure(PartialFailurePolicy::SkipIteration)
            .build()
            .unwrap();

        let result = Runner::new(config).run_benchmark(&flaky("hopeless", 1, &[0, 1, 2]));

        assert!(matches!(result, Err(Error::AllForksFailed { .. })));
    }

    #[test]
    fn descriptor_overrides_take_precedence() {
        let measured = Arc::new(AtomicU32::new(0));
        let descriptor = BenchmarkDescriptor::builder("override")
            .measurement(PhaseSpec::counted(1, 7))
            .warmup(PhaseSpec::counted(0, 1))
            .payload(Payload::new({
                let measured = Arc::clone(&measured);
                move |_| {
                    let measured = Arc::clone(&measured);
                    PayloadKind::void(move |_| {
                        measured.fetch_add(1, Ordering::Relaxed);
                    })
                }
            }))
            .build()
            .unwrap();

        let report = Runner::new(quick_config().build().unwrap())
            .run_benchmark(&descriptor)
            .unwrap();

        assert_eq!(measured.load(Ordering::Relaxed), 7);
        assert_eq!(report.result().accumulator().ops(), 7);
    }

    #[test]
    fn single_shot_rejects_duration_targets() {
        let descriptor = BenchmarkDescriptor::builder("single_shot")
            .mode(Mode::SingleShotTime)
            .payload(Payload::new(|_| PayloadKind::void(|_| {})))
            .build()
            .unwrap();

        let config = RunConfig::builder()
            .forks(0)
            .measurement(PhaseSpec::timed(1, Duration::from_millis(10)))
            .build()
            .unwrap();

        let result = Runner::new(config).run_benchmark(&descriptor);

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn thread_override_skips_multi_group_benchmarks() {
        let descriptor = BenchmarkDescriptor::builder("groups")
            .group("a", 1, Payload::new(|_| PayloadKind::void(|_| {})))
            .group("b", 2, Payload::new(|_| PayloadKind::void(|_| {})))
            .build()
            .unwrap();

        let config = quick_config().threads(nz!(8)).build().unwrap();
        let report = Runner::new(config).run_benchmark(&descriptor).unwrap();

        // Three threads, three iterations, ten invocations each.
        assert_eq!(report.result().accumulator().ops(), 90);
        assert_eq!(report.group_result("a").unwrap().accumulator().ops(), 30);
        assert_eq!(report.group_result("b").unwrap().accumulator().ops(), 60);
    }

    #[test]
    fn run_report_lists_group_results_after_their_benchmark() {
        let mut registry = BenchmarkRegistry::new();
        registry.register(noop("first")).unwrap();
        registry
            .register(
                BenchmarkDescriptor::builder("pair")
                    .group("left", 1, Payload::new(|_| PayloadKind::void(|_| {})))
                    .group("right", 1, Payload::new(|_| PayloadKind::void(|_| {})))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let report = Runner::new(quick_config().build().unwrap())
            .run(&registry)
            .unwrap();

        let names: Vec<_> = report.results().map(|(name, _)| name).collect();
        assert_eq!(names, ["first", "pair", "pair:left", "pair:right"]);
        assert!(report.is_success());
    }

    #[test]
    fn failed_benchmark_does_not_stop_the_run() {
        let mut registry = BenchmarkRegistry::new();
        registry.register(flaky("broken", 1, &[0])).unwrap();
        registry.register(noop("fine")).unwrap();

        let report = Runner::new(quick_config().build().unwrap())
            .run(&registry)
            .unwrap();

        let names: Vec<_> = report.results().map(|(name, _)| name).collect();
        assert_eq!(names, ["fine"]);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");
        assert!(matches!(failures[0].1, Error::AllForksFailed { .. }));
    }

    #[test]
    fn in_process_run_timeout_stops_between_iterations() {
        let descriptor = BenchmarkDescriptor::builder("slow")
            .payload(Payload::new(|_| {
                PayloadKind::void(|_| std::thread::sleep(Duration::from_millis(20)))
            }))
            .build()
            .unwrap();

        let config = RunConfig::builder()
            .forks(0)
            .warmup(PhaseSpec::counted(0, 1))
            .measurement(PhaseSpec::counted(100, 1))
            .run_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let result = Runner::new(config).run_benchmark(&descriptor);

        let Err(Error::AllForksFailed { failures, .. }) = result else {
            panic!("expected the only fork to fail");
        };
        assert!(matches!(failures[0].error(), Error::RunTimeout { .. }));
        assert!(failures[0].partial().is_some());
    }
}
