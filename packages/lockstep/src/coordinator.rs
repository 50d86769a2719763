use std::any::Any;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use oneshot::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::barrier::LockstepBarrier;
use crate::error::Result;
use crate::iteration::IterationLoop;
use crate::timer::IterationTimer;
use crate::{
    AggregatedResult, BenchmarkDescriptor, Blackhole, Control, Error, IterationParams, Mode,
    Payload, Phase, RawResult, Stage, ThreadFailure, ThreadMeta,
};

/// Settings of a coordinator that do not come from the benchmark descriptor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CoordinatorSettings {
    pub(crate) sample_capacity: NonZero<usize>,

    /// How long setup may take, and how long an iteration may run past its target.
    pub(crate) iteration_timeout: Duration,
}

/// What came out of one iteration across all worker threads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct IterationOutcome {
    pub(crate) params: IterationParams,

    /// Threads that failed in this iteration.
    pub(crate) failures: Vec<ThreadFailure>,

    /// The combination of the clean threads' results. Only present for measurement iterations.
    pub(crate) measurement: Option<AggregatedResult>,
}

/// Owns the worker threads of one benchmark for the whole run and drives them through
/// synchronized iterations.
///
/// Every active group gets its declared number of long-lived worker threads. Before every
/// iteration the coordinator resets its barrier to the number of worker threads plus itself,
/// hands each worker its iteration order and joins the barrier, which releases everyone at the
/// same instant. For duration targets the timer then requests a stop at release plus the
/// target duration. The coordinator waits for every worker's report until the target plus the
/// iteration timeout has passed.
///
/// A worker that misses the barrier or the report deadline is presumed hung. The coordinator is
/// then poisoned: it accepts no more iterations and on drop abandons its threads instead of
/// joining them.
#[derive(Debug)]
pub(crate) struct ThreadGroupCoordinator {
    benchmark: String,
    sync_iterations: bool,
    settings: CoordinatorSettings,
    workers: Vec<Worker>,
    active_groups: Vec<Arc<str>>,
    barrier: Arc<LockstepBarrier>,
    timer: IterationTimer,
    poisoned: bool,
}

#[derive(Debug)]
struct Worker {
    meta: ThreadMeta,
    command_tx: mpsc::Sender<ThreadCommand>,
    join_handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
enum ThreadCommand {
    Iterate(IterationOrder),
    Shutdown,
}

#[derive(Debug)]
struct IterationOrder {
    control: Arc<Control>,
    report_tx: oneshot::Sender<ThreadReport>,
    synchronized: bool,
    barrier_deadline: Instant,
}

#[derive(Debug)]
enum ThreadReport {
    Completed(RawResult),
    Panicked(String),

    /// The barrier broke before the iteration started.
    Abandoned,
}

/// Whether a worker thread created its payload, or the panic message if it did not.
type SetupReport = std::result::Result<(), String>;

#[derive(Clone, Copy, Debug)]
struct WorkerConfig {
    mode: Mode,
    sample_capacity: NonZero<usize>,
}

impl ThreadGroupCoordinator {
    /// Starts the worker threads of `descriptor` and creates their payloads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payload`] if a payload factory panics, [`Error::SynchronizationTimeout`]
    /// if a payload factory does not return within the iteration timeout and [`Error::Spawn`]
    /// if a thread cannot be started.
    pub(crate) fn start(
        descriptor: &BenchmarkDescriptor,
        settings: CoordinatorSettings,
    ) -> Result<Self> {
        let timer = IterationTimer::start().map_err(Error::Spawn)?;
        let barrier = Arc::new(LockstepBarrier::new());
        let total_threads = descriptor.total_threads();

        let worker_config = WorkerConfig {
            mode: descriptor.mode(),
            sample_capacity: settings.sample_capacity,
        };

        let mut coordinator = Self {
            benchmark: descriptor.name().to_string(),
            sync_iterations: descriptor.sync_iterations(),
            settings,
            workers: Vec::with_capacity(total_threads.get()),
            active_groups: Vec::new(),
            barrier,
            timer,
            poisoned: false,
        };

        let mut setup_rxs = Vec::with_capacity(total_threads.get());
        let mut global_index = 0_usize;

        for (group_index, group) in descriptor.groups().iter().enumerate() {
            let Some(threads_in_group) = NonZero::new(group.threads()) else {
                debug!(
                    benchmark = %coordinator.benchmark,
                    group = group.name(),
                    "skipping group without threads"
                );
                continue;
            };

            coordinator.active_groups.push(Arc::clone(group.name_shared()));

            for index_in_group in 0..threads_in_group.get() {
                let meta = ThreadMeta::new(
                    Arc::clone(group.name_shared()),
                    group_index,
                    index_in_group,
                    threads_in_group,
                    global_index,
                    total_threads,
                );
                global_index = global_index
                    .checked_add(1)
                    .expect("thread count is bounded by total_threads");

                let (command_tx, command_rx) = mpsc::channel();
                let (setup_tx, setup_rx) = oneshot::channel();

                let join_handle = thread::Builder::new()
                    .name(format!("lockstep-{}-{index_in_group}", group.name()))
                    .spawn({
                        let meta = meta.clone();
                        let payload = group.payload().clone();
                        let barrier = Arc::clone(&coordinator.barrier);
                        move || {
                            debug!(thread = %meta.label(), "worker thread started");
                            worker_entrypoint(
                                &meta,
                                &payload,
                                setup_tx,
                                &command_rx,
                                &barrier,
                                worker_config,
                            );
                            debug!(thread = %meta.label(), "worker thread exiting");
                        }
                    })
                    .map_err(Error::Spawn)?;

                setup_rxs.push(setup_rx);
                coordinator.workers.push(Worker {
                    meta,
                    command_tx,
                    join_handle: Some(join_handle),
                });
            }
        }

        let setup_deadline = Instant::now()
            .checked_add(settings.iteration_timeout)
            .expect("iteration timeout must fit in an Instant");

        let mut missing = Vec::new();
        let mut first_failure = None;

        for (worker, setup_rx) in coordinator.workers.iter().zip(setup_rxs) {
            match setup_rx.recv_deadline(setup_deadline) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    first_failure.get_or_insert_with(|| Error::Payload {
                        thread: worker.meta.label(),
                        stage: Stage::Setup,
                        message,
                    });
                }
                Err(RecvTimeoutError::Timeout) => missing.push(worker.meta.label()),
                Err(RecvTimeoutError::Disconnected) => {
                    first_failure.get_or_insert_with(|| Error::Payload {
                        thread: worker.meta.label(),
                        stage: Stage::Setup,
                        message: "worker thread exited during setup".to_string(),
                    });
                }
            }
        }

        if !missing.is_empty() {
            coordinator.poisoned = true;

            return Err(Error::SynchronizationTimeout {
                stage: Stage::Setup,
                timeout: settings.iteration_timeout,
                missing,
            });
        }

        if let Some(error) = first_failure {
            return Err(error);
        }

        debug!(
            benchmark = %coordinator.benchmark,
            threads = coordinator.workers.len(),
            groups = coordinator.active_groups.len(),
            "worker threads ready"
        );

        Ok(coordinator)
    }

    /// Number of worker threads.
    pub(crate) fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Executes one iteration on every worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SynchronizationTimeout`] if any thread misses the start barrier or does
    /// not report back in time. The coordinator is unusable afterwards.
    ///
    /// # Panics
    ///
    /// Panics if called after a synchronization timeout.
    pub(crate) fn run_iteration(&mut self, params: IterationParams) -> Result<IterationOutcome> {
        assert!(
            !self.poisoned,
            "coordinator cannot run iterations after a synchronization timeout"
        );

        trace!(
            benchmark = %self.benchmark,
            phase = %params.phase(),
            index = params.index(),
            "iteration starting"
        );

        let control = Arc::new(Control::new(params));
        let live = self.workers.len();

        if self.sync_iterations {
            self.barrier
                .reset(live.checked_add(1).expect("thread count is far below usize::MAX"));
        }

        let dispatched_at = Instant::now();
        let barrier_deadline = dispatched_at
            .checked_add(self.settings.iteration_timeout)
            .expect("iteration timeout must fit in an Instant");

        let mut report_rxs = Vec::with_capacity(live);

        for worker in &self.workers {
            let (report_tx, report_rx) = oneshot::channel();

            worker
                .command_tx
                .send(ThreadCommand::Iterate(IterationOrder {
                    control: Arc::clone(&control),
                    report_tx,
                    synchronized: self.sync_iterations,
                    barrier_deadline,
                }))
                .expect("worker threads only exit on shutdown once set up successfully");

            report_rxs.push(report_rx);
        }

        let released_at = if self.sync_iterations {
            match self.barrier.wait(live, barrier_deadline) {
                Ok(released_at) => released_at,
                Err(broken) => {
                    control.request_stop();
                    self.poisoned = true;

                    return Err(Error::SynchronizationTimeout {
                        stage: params.stage(),
                        timeout: self.settings.iteration_timeout,
                        missing: broken
                            .missing
                            .iter()
                            .filter_map(|&party| self.workers.get(party))
                            .map(|worker| worker.meta.label())
                            .collect(),
                    });
                }
            }
        } else {
            dispatched_at
        };

        let target = params.target().duration().unwrap_or_default();

        if let Some(duration) = params.target().duration() {
            self.timer.arm(
                released_at
                    .checked_add(duration)
                    .expect("iteration duration must fit in an Instant"),
                Arc::clone(&control),
            );
        }

        let report_deadline = released_at
            .checked_add(target)
            .and_then(|t| t.checked_add(self.settings.iteration_timeout))
            .expect("iteration deadline must fit in an Instant");

        let mut completed = Vec::with_capacity(live);
        let mut failures = Vec::new();
        let mut missing = Vec::new();

        for (worker, report_rx) in self.workers.iter().zip(report_rxs) {
            let group = Arc::clone(worker.meta.group_name_shared());

            match report_rx.recv_deadline(report_deadline) {
                Ok(ThreadReport::Completed(raw)) => completed.push((group, raw)),
                Ok(ThreadReport::Panicked(message)) => failures.push(ThreadFailure::new(
                    worker.meta.label(),
                    group.to_string(),
                    message,
                )),
                Ok(ThreadReport::Abandoned) | Err(RecvTimeoutError::Timeout) => {
                    missing.push(worker.meta.label());
                }
                Err(RecvTimeoutError::Disconnected) => failures.push(ThreadFailure::new(
                    worker.meta.label(),
                    group.to_string(),
                    "worker thread exited without reporting".to_string(),
                )),
            }
        }

        self.timer.disarm();

        if !missing.is_empty() {
            control.request_stop();
            self.poisoned = true;

            return Err(Error::SynchronizationTimeout {
                stage: params.stage(),
                timeout: self.settings.iteration_timeout,
                missing,
            });
        }

        let measurement = (params.phase() == Phase::Measurement).then(|| {
            AggregatedResult::from_reports(
                params.index(),
                &self.active_groups,
                &completed,
                &failures,
            )
        });

        trace!(
            benchmark = %self.benchmark,
            phase = %params.phase(),
            index = params.index(),
            clean = completed.len(),
            failed = failures.len(),
            "iteration finished"
        );

        Ok(IterationOutcome {
            params,
            failures,
            measurement,
        })
    }
}

impl Drop for ThreadGroupCoordinator {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }

        for worker in &self.workers {
            // A thread whose setup failed has already exited.
            _ = worker.command_tx.send(ThreadCommand::Shutdown);
        }

        if self.poisoned {
            // Hung threads never pick up the shutdown command. Joining them would hang the
            // caller, so they are left to be torn down with the process.
            debug!(
                benchmark = %self.benchmark,
                "abandoning worker threads of poisoned coordinator"
            );
            self.barrier.break_now();
            return;
        }

        for worker in &mut self.workers {
            if let Some(handle) = worker.join_handle.take() {
                handle
                    .join()
                    .expect("worker threads catch every payload panic");
            }
        }
    }
}

#[cfg_attr(test, mutants::skip)] // Impractical to test that things do not happen when the worker is missing.
fn worker_entrypoint(
    meta: &ThreadMeta,
    payload: &Payload,
    setup_tx: oneshot::Sender<SetupReport>,
    command_rx: &mpsc::Receiver<ThreadCommand>,
    barrier: &LockstepBarrier,
    config: WorkerConfig,
) {
    let mut payload = match panic::catch_unwind(AssertUnwindSafe(|| payload.instantiate(meta))) {
        Ok(payload) => payload,
        Err(panic) => {
            _ = setup_tx.send(Err(panic_message(&*panic)));
            return;
        }
    };

    trace!(thread = %meta.label(), shape = ?payload.shape(), "payload created");
    _ = setup_tx.send(Ok(()));

    let mut blackhole = Blackhole::new();

    while let Ok(ThreadCommand::Iterate(order)) = command_rx.recv() {
        let released_at = if order.synchronized {
            match barrier.wait(meta.global_index(), order.barrier_deadline) {
                Ok(released_at) => released_at,
                Err(_) => {
                    // The coordinator reports the threads that did not make it.
                    _ = order.report_tx.send(ThreadReport::Abandoned);
                    continue;
                }
            }
        } else {
            Instant::now()
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            IterationLoop::new(&mut payload, &mut blackhole, config.mode, config.sample_capacity)
                .run(&order.control, released_at)
        }));

        let report = match outcome {
            Ok(raw) => ThreadReport::Completed(raw),
            Err(panic) => {
                // Let the other threads drain instead of waiting on a partner that is gone.
                order.control.request_stop();
                ThreadReport::Panicked(panic_message(&*panic))
            }
        };

        // The coordinator may have given up on this iteration already.
        _ = order.report_tx.send(report);
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
