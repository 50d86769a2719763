use std::ffi::OsString;
use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::coordinator::IterationOutcome;
use crate::error::Result;
use crate::fork::framing::{FrameError, read_frame, write_frame};
use crate::fork::protocol::{
    IterationReply, PROTOCOL_VERSION, SampleAssembler, SupervisorMessage, WorkerMessage,
    WorkerSettings,
};
use crate::fork::{FORK_INDEX_ENV, SUPERVISOR_ADDR_ENV};
use crate::{Error, IterationParams};

/// How often the supervisor checks on a worker process that has not connected yet.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extra time granted on top of the worker's own deadlines before a reply counts as missing.
const REPLY_SLACK: Duration = Duration::from_secs(1);

/// How long a worker process may take to exit after being told to shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How a worker process is launched.
///
/// The launched program must call [`serve_if_worker()`][crate::serve_if_worker] with a registry
/// containing the benchmarks being run, before doing anything else. By default the current
/// executable is launched again without arguments.
///
/// # Examples
///
/// ```
/// use lockstep::{RunConfig, Runner, WorkerLaunch};
///
/// let launch = WorkerLaunch::new("target/release/my-benches")
///     .arg("--worker")
///     .env("RUST_LOG", "lockstep=debug");
///
/// let runner = Runner::new(RunConfig::default()).worker_launch(launch);
/// # drop(runner);
/// ```
#[derive(Clone, Debug)]
pub struct WorkerLaunch {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl WorkerLaunch {
    /// Launches `program` as the worker process.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Launches the currently running executable as the worker process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the path of the current executable cannot be determined.
    pub fn current_exe() -> Result<Self> {
        std::env::current_exe().map(Self::new).map_err(Error::Spawn)
    }

    /// Appends a command line argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the worker process, in addition to the inherited ones.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// The program that is launched.
    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

/// A live worker process that has selected its benchmark and is ready to run iterations.
///
/// Dropping the value without calling [`finish()`][Self::finish] kills the process.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    fork: u32,
    child: Child,
    stream: TcpStream,
    threads: usize,
    iteration_timeout: Duration,
    run_deadline: Option<Instant>,
    run_timeout: Option<Duration>,
    finished: bool,
}

impl WorkerProcess {
    /// Launches a worker process for fork number `fork` and has it set up `benchmark`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the process cannot be launched, [`Error::Channel`] if it does
    /// not complete the handshake within `handshake_timeout` and whatever error the worker
    /// reports if it fails to set up the benchmark.
    pub(crate) fn spawn(
        launch: &WorkerLaunch,
        fork: u32,
        benchmark: &str,
        settings: WorkerSettings,
        handshake_timeout: Duration,
        run_timeout: Option<Duration>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(Error::Spawn)?;
        let addr = listener.local_addr().map_err(Error::Spawn)?;
        listener.set_nonblocking(true).map_err(Error::Spawn)?;

        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .envs(launch.envs.iter().map(|(k, v)| (k, v)))
            .env(SUPERVISOR_ADDR_ENV, addr.to_string())
            .env(FORK_INDEX_ENV, fork.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(Error::Spawn)?;

        let started_at = Instant::now();
        let run_deadline = run_timeout.and_then(|timeout| started_at.checked_add(timeout));
        let handshake_deadline = started_at
            .checked_add(handshake_timeout)
            .expect("handshake timeout must fit in an Instant");

        debug!(fork, pid = child.id(), %addr, "worker process launched");

        let stream = match accept_worker(&listener, &mut child, handshake_deadline) {
            Ok(stream) => stream,
            Err(error) => {
                _ = child.kill();
                _ = child.wait();
                return Err(error);
            }
        };

        // From here on, dropping `worker` on an error path kills the process.
        let mut worker = Self {
            fork,
            child,
            stream,
            threads: 0,
            iteration_timeout: settings.iteration_timeout,
            run_deadline,
            run_timeout,
            finished: false,
        };

        worker.set_read_deadline(handshake_deadline)?;

        match worker.receive()? {
            WorkerMessage::Hello {
                protocol_version,
                pid,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(Error::channel(format!(
                        "worker speaks protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }

                trace!(fork, pid, "worker process said hello");
            }
            other => {
                return Err(Error::channel(format!(
                    "expected Hello from worker, got {other:?}"
                )));
            }
        }

        worker.send(&SupervisorMessage::Select {
            benchmark: benchmark.to_string(),
            settings,
        })?;

        // Setting up the payloads is bounded by the worker's iteration timeout.
        let setup_deadline = Instant::now()
            .checked_add(settings.iteration_timeout)
            .and_then(|t| t.checked_add(REPLY_SLACK))
            .expect("iteration timeout must fit in an Instant");
        worker.set_read_deadline(setup_deadline)?;

        match worker.receive()? {
            WorkerMessage::Ready { threads } => worker.threads = threads,
            WorkerMessage::Error(remote) => return Err(remote.into()),
            other => {
                return Err(Error::channel(format!(
                    "expected Ready from worker, got {other:?}"
                )));
            }
        }

        debug!(
            fork,
            benchmark,
            threads = worker.threads,
            "worker process ready"
        );

        Ok(worker)
    }

    /// Number of worker threads the worker process started.
    pub(crate) fn thread_count(&self) -> usize {
        self.threads
    }

    /// Has the worker process execute one iteration and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Returns the error the worker reports, [`Error::RunTimeout`] if the run deadline passes
    /// first and [`Error::Channel`] if the worker stops responding. The worker process is
    /// unusable after any error.
    pub(crate) fn run_iteration(&mut self, params: IterationParams) -> Result<IterationOutcome> {
        let own_deadline = Instant::now()
            .checked_add(params.target().duration().unwrap_or_default())
            // The worker may spend up to one timeout on the start barrier and one on reports.
            .and_then(|t| t.checked_add(self.iteration_timeout))
            .and_then(|t| t.checked_add(self.iteration_timeout))
            .and_then(|t| t.checked_add(REPLY_SLACK))
            .expect("iteration deadline must fit in an Instant");

        let (deadline, limited_by_run) = match self.run_deadline {
            Some(run_deadline) if run_deadline < own_deadline => (run_deadline, true),
            _ => (own_deadline, false),
        };

        if limited_by_run && deadline <= Instant::now() {
            return Err(self.run_timed_out());
        }

        self.send(&SupervisorMessage::RunIteration(params))?;

        let mut assembler = SampleAssembler::default();

        loop {
            match self.read_reply(params, deadline, limited_by_run)? {
                WorkerMessage::Samples { group, samples } => assembler.add(group, samples),
                WorkerMessage::IterationResult(IterationReply::Completed(outcome)) => {
                    if outcome.params != params {
                        self.terminate();
                        return Err(Error::channel(format!(
                            "worker replied to {} while {} was outstanding",
                            outcome.params.stage(),
                            params.stage()
                        )));
                    }

                    return assembler.complete(outcome).map_err(|problem| {
                        self.terminate();
                        Error::channel(problem)
                    });
                }
                WorkerMessage::IterationResult(IterationReply::Failed(remote)) => {
                    return Err(remote.into());
                }
                other => {
                    self.terminate();
                    return Err(Error::channel(format!(
                        "expected an iteration result from worker, got {other:?}"
                    )));
                }
            }
        }
    }

    /// Reads one message belonging to the outstanding iteration `params`.
    ///
    /// Any failure to read is fatal for the worker process, which is killed.
    fn read_reply(
        &mut self,
        params: IterationParams,
        deadline: Instant,
        limited_by_run: bool,
    ) -> Result<WorkerMessage> {
        self.set_read_deadline(deadline)?;

        match read_frame::<_, WorkerMessage>(&mut self.stream) {
            Ok(reply) => Ok(reply),
            Err(FrameError::TimedOut) if limited_by_run => Err(self.run_timed_out()),
            Err(FrameError::TimedOut) => {
                let status = self.terminate();
                Err(Error::channel(format!(
                    "worker did not reply during {}; killed ({status})",
                    params.stage()
                )))
            }
            Err(FrameError::EndOfStream) => {
                let status = self.terminate();
                Err(Error::channel(format!(
                    "worker exited during {} ({status})",
                    params.stage()
                )))
            }
            Err(other) => {
                self.terminate();
                Err(Error::channel(other.to_string()))
            }
        }
    }

    /// Tells the worker process to shut down and waits for it to exit.
    ///
    /// A worker that does not exit within a grace period is killed.
    pub(crate) fn finish(mut self) {
        self.finished = true;

        if self.send(&SupervisorMessage::Shutdown).is_err() {
            self.terminate();
            return;
        }

        let deadline = Instant::now()
            .checked_add(SHUTDOWN_GRACE)
            .expect("shutdown grace period must fit in an Instant");

        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(fork = self.fork, %status, "worker process exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(ACCEPT_POLL_INTERVAL),
                _ => {
                    let status = self.terminate();
                    debug!(
                        fork = self.fork,
                        %status,
                        "worker process killed after shutdown grace period"
                    );
                    return;
                }
            }
        }
    }

    fn run_timed_out(&mut self) -> Error {
        self.terminate();

        Error::RunTimeout {
            timeout: self
                .run_timeout
                .expect("run deadline only exists with a run timeout"),
        }
    }

    /// Kills the process and describes how it ended.
    fn terminate(&mut self) -> String {
        self.finished = true;

        // Fails if the process has already exited, which is fine.
        _ = self.child.kill();

        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => format!("exit status unavailable: {e}"),
        }
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<()> {
        // A zero timeout is rejected by the socket, so always allow a sliver of time.
        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::channel(e.to_string()))
    }

    fn send(&mut self, message: &SupervisorMessage) -> Result<()> {
        write_frame(&mut self.stream, message).map_err(|e| Error::channel(e.to_string()))
    }

    fn receive(&mut self) -> Result<WorkerMessage> {
        read_frame(&mut self.stream).map_err(|e| match e {
            FrameError::TimedOut => Error::channel("timed out waiting for the worker"),
            FrameError::EndOfStream => {
                let status = self.terminate();
                Error::channel(format!("worker closed the channel ({status})"))
            }
            other => Error::channel(other.to_string()),
        })
    }
}

impl Drop for WorkerProcess {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that a process is gone.
    fn drop(&mut self) {
        if !self.finished {
            self.terminate();
        }
    }
}

fn accept_worker(
    listener: &TcpListener,
    child: &mut Child,
    deadline: Instant,
) -> Result<TcpStream> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                // Some platforms hand out sockets that inherit the listener's blocking mode.
                stream
                    .set_nonblocking(false)
                    .map_err(|e| Error::channel(e.to_string()))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| Error::channel(e.to_string()))?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(status) = child.try_wait().map_err(Error::Spawn)? {
                    return Err(Error::channel(format!(
                        "worker exited before connecting ({status})"
                    )));
                }

                if Instant::now() >= deadline {
                    return Err(Error::channel("worker did not connect in time"));
                }

                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(Error::channel(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            threads: None,
            sample_capacity: nz!(16),
            iteration_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn launch_collects_args_and_envs() {
        let launch = WorkerLaunch::new("bench")
            .arg("--worker")
            .env("RUST_LOG", "debug");

        assert_eq!(launch.program(), &PathBuf::from("bench"));
        assert_eq!(launch.args, [OsString::from("--worker")]);
        assert_eq!(
            launch.envs,
            [(OsString::from("RUST_LOG"), OsString::from("debug"))]
        );
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let launch = WorkerLaunch::new("/definitely/not/a/lockstep/worker");

        let result = WorkerProcess::spawn(
            &launch,
            0,
            "bench",
            settings(),
            Duration::from_secs(1),
            None,
        );

        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[cfg(unix)]
    #[test]
    fn worker_exiting_before_handshake_is_channel_error() {
        let launch = WorkerLaunch::new("true");

        let result = WorkerProcess::spawn(
            &launch,
            0,
            "bench",
            settings(),
            Duration::from_secs(10),
            None,
        );

        let Err(Error::Channel { reason }) = result else {
            panic!("expected channel error");
        };
        assert!(reason.contains("exited before connecting"));
    }

    #[cfg(unix)]
    #[test]
    fn silent_worker_times_out_handshake() {
        let launch = WorkerLaunch::new("sleep").arg("30");
        let started = Instant::now();

        let result = WorkerProcess::spawn(
            &launch,
            0,
            "bench",
            settings(),
            Duration::from_millis(200),
            None,
        );

        assert!(matches!(result, Err(Error::Channel { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
