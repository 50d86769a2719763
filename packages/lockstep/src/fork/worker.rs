use std::net::{SocketAddr, TcpStream};
use std::process;

use tracing::{debug, warn};

use crate::coordinator::{CoordinatorSettings, ThreadGroupCoordinator};
use crate::error::Result;
use crate::fork::framing::{FrameError, read_frame, write_frame};
use crate::fork::protocol::{
    IterationReply, PROTOCOL_VERSION, RemoteError, SAMPLE_CHUNK_LEN, SupervisorMessage,
    WorkerMessage, WorkerSettings, write_completed,
};
use crate::{BenchmarkDescriptor, BenchmarkRegistry, Error};

/// Serves one fork: connects back to the supervisor at `addr`, sets up the benchmark it selects
/// and runs iterations on request until told to shut down.
///
/// Returns the error that ended the fork early, after reporting it to the supervisor if the
/// channel still works. Hung worker threads may still be alive when this returns with an error,
/// so the caller is expected to exit the process.
pub(crate) fn serve(registry: &BenchmarkRegistry, addr: SocketAddr) -> Result<()> {
    let mut stream = TcpStream::connect(addr).map_err(|e| Error::channel(e.to_string()))?;
    stream
        .set_nodelay(true)
        .map_err(|e| Error::channel(e.to_string()))?;

    send(
        &mut stream,
        &WorkerMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            pid: process::id(),
        },
    )?;

    let SupervisorMessage::Select {
        benchmark,
        settings,
    } = receive(&mut stream)?
    else {
        return Err(Error::channel("expected Select as the first supervisor message"));
    };

    debug!(benchmark = %benchmark, "worker process selected benchmark");

    let coordinator = registry
        .get(&benchmark)
        .ok_or_else(|| Error::UnknownBenchmark {
            name: benchmark.clone(),
        })
        .and_then(|descriptor| start_coordinator(descriptor, settings));

    let mut coordinator = match coordinator {
        Ok(coordinator) => coordinator,
        Err(error) => {
            send(&mut stream, &WorkerMessage::Error(RemoteError::from(&error)))?;
            return Err(error);
        }
    };

    send(
        &mut stream,
        &WorkerMessage::Ready {
            threads: coordinator.thread_count(),
        },
    )?;

    loop {
        match receive(&mut stream)? {
            SupervisorMessage::RunIteration(params) => match coordinator.run_iteration(params) {
                Ok(outcome) => write_completed(&mut stream, outcome, SAMPLE_CHUNK_LEN)
                    .map_err(|e| Error::channel(e.to_string()))?,
                Err(error) => {
                    warn!(benchmark = %benchmark, error = %error, "iteration failed in worker process");
                    send(
                        &mut stream,
                        &WorkerMessage::IterationResult(IterationReply::Failed(
                            RemoteError::from(&error),
                        )),
                    )?;
                    return Err(error);
                }
            },
            SupervisorMessage::Shutdown => {
                debug!(benchmark = %benchmark, "worker process shutting down");
                return Ok(());
            }
            SupervisorMessage::Select { .. } => {
                return Err(Error::channel("benchmark already selected"));
            }
        }
    }
}

fn start_coordinator(
    descriptor: &BenchmarkDescriptor,
    settings: WorkerSettings,
) -> Result<ThreadGroupCoordinator> {
    let overridden = settings
        .threads
        .and_then(|threads| descriptor.with_thread_override(threads));

    ThreadGroupCoordinator::start(
        overridden.as_ref().unwrap_or(descriptor),
        CoordinatorSettings {
            sample_capacity: settings.sample_capacity,
            iteration_timeout: settings.iteration_timeout,
        },
    )
}

fn send(stream: &mut TcpStream, message: &WorkerMessage) -> Result<()> {
    write_frame(stream, message).map_err(|e| Error::channel(e.to_string()))
}

fn receive(stream: &mut TcpStream) -> Result<SupervisorMessage> {
    read_frame(stream).map_err(|e| match e {
        FrameError::EndOfStream => Error::channel("supervisor closed the channel"),
        other => Error::channel(other.to_string()),
    })
}
