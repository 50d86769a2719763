//! Running benchmarks in isolated worker processes.
//!
//! The supervisor launches a worker process per fork, hands it the address of a loopback
//! listener through the environment and drives it over length-prefixed JSON frames. The worker
//! process must recognize its role by calling [`serve_if_worker()`] early in `main()`.

mod framing;
mod protocol;
mod supervisor;
mod worker;

use std::env;
use std::net::SocketAddr;

pub(crate) use protocol::WorkerSettings;
pub use supervisor::WorkerLaunch;
pub(crate) use supervisor::WorkerProcess;

use crate::{BenchmarkRegistry, Error};

/// Address of the supervisor's listener. Only set in worker processes.
pub(crate) const SUPERVISOR_ADDR_ENV: &str = "LOCKSTEP_SUPERVISOR_ADDR";

/// Index of the fork a worker process serves, starting from 0.
pub(crate) const FORK_INDEX_ENV: &str = "LOCKSTEP_FORK_INDEX";

/// Serves as a worker process if this process was launched as one by a supervisor.
///
/// Returns `None` in a process that is not a worker, which should go on with whatever it
/// normally does. In a worker process, serves the supervisor until it is done with this fork
/// and returns the outcome. The process should exit right after, since worker threads that
/// hung during the fork may still be running.
///
/// # Examples
///
/// ```no_run
/// use lockstep::{BenchmarkRegistry, RunConfig, Runner, serve_if_worker};
///
/// fn registry() -> BenchmarkRegistry {
///     // Register the same benchmarks in the supervisor and in the workers.
///     BenchmarkRegistry::new()
/// }
///
/// fn main() {
///     let registry = registry();
///
///     if let Some(outcome) = serve_if_worker(&registry) {
///         std::process::exit(i32::from(outcome.is_err()));
///     }
///
///     let report = Runner::new(RunConfig::default()).run(&registry).unwrap();
///     # drop(report);
/// }
/// ```
pub fn serve_if_worker(registry: &BenchmarkRegistry) -> Option<Result<(), Error>> {
    let addr = env::var(SUPERVISOR_ADDR_ENV).ok()?;

    Some(
        addr.parse::<SocketAddr>()
            .map_err(|e| {
                Error::configuration(format!(
                    "{SUPERVISOR_ADDR_ENV} is not a socket address ({addr}): {e}"
                ))
            })
            .and_then(|addr| worker::serve(registry, addr)),
    )
}

/// Index of the fork the current process serves, or `None` if it is not a worker process.
#[must_use]
pub fn fork_index() -> Option<u32> {
    env::var(FORK_INDEX_ENV).ok()?.parse().ok()
}

pub(crate) fn is_worker_process() -> bool {
    env::var_os(SUPERVISOR_ADDR_ENV).is_some()
}
