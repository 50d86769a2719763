//! Messages exchanged between the supervising process and a worker process.
//!
//! The supervisor is the client: it sends one request and waits for exactly one reply.
//!
//! ```text
//! worker                       supervisor
//!   |  Hello                       |
//!   | ---------------------------> |
//!   |               Select         |
//!   | <--------------------------- |
//!   |  Ready | Error               |
//!   | ---------------------------> |
//!   |         RunIteration         |  (repeated)
//!   | <--------------------------- |
//!   |  Samples                     |  (zero or more, measurement only)
//!   | ---------------------------> |
//!   |  IterationResult             |
//!   | ---------------------------> |
//!   |             Shutdown         |
//!   | <--------------------------- |
//! ```
//!
//! The latency samples of a measurement iteration are not part of the iteration result. They
//! precede it as a stream of `Samples` chunks so that no single frame grows with the number of
//! threads or samples.

use std::collections::BTreeMap;
use std::io::Write;
use std::num::NonZero;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::IterationOutcome;
use crate::fork::framing::{FrameError, write_frame};
use crate::{Error, IterationParams, Stage};

/// Bumped whenever a message changes shape.
pub(crate) const PROTOCOL_VERSION: u32 = 2;

/// Samples per `Samples` message. A sample takes at most 21 bytes of JSON, so a full chunk
/// stays well below the frame size limit.
pub(crate) const SAMPLE_CHUNK_LEN: usize = 1 << 18;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum WorkerMessage {
    Hello { protocol_version: u32, pid: u32 },
    Ready { threads: usize },
    Samples { group: String, samples: Vec<u64> },
    IterationResult(IterationReply),
    Error(RemoteError),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum SupervisorMessage {
    Select {
        benchmark: String,
        settings: WorkerSettings,
    },
    RunIteration(IterationParams),
    Shutdown,
}

/// Run-wide settings the worker needs to set up its coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct WorkerSettings {
    pub(crate) threads: Option<NonZero<usize>>,
    pub(crate) sample_capacity: NonZero<usize>,
    pub(crate) iteration_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum IterationReply {
    Completed(IterationOutcome),
    Failed(RemoteError),
}

/// Sends a completed iteration, streaming the samples of each group ahead of the result in
/// chunks of at most `chunk_len` samples.
pub(crate) fn write_completed<W: Write>(
    writer: &mut W,
    mut outcome: IterationOutcome,
    chunk_len: usize,
) -> Result<(), FrameError> {
    if let Some(measurement) = outcome.measurement.as_mut() {
        for (group, samples) in measurement.take_samples() {
            for chunk in samples.chunks(chunk_len) {
                write_frame(
                    writer,
                    &WorkerMessage::Samples {
                        group: group.clone(),
                        samples: chunk.to_vec(),
                    },
                )?;
            }
        }
    }

    write_frame(
        writer,
        &WorkerMessage::IterationResult(IterationReply::Completed(outcome)),
    )
}

/// Collects streamed samples until the iteration result they belong to arrives.
#[derive(Debug, Default)]
pub(crate) struct SampleAssembler {
    samples: BTreeMap<String, Vec<u64>>,
}

impl SampleAssembler {
    pub(crate) fn add(&mut self, group: String, samples: Vec<u64>) {
        self.samples.entry(group).or_default().extend(samples);
    }

    /// Attaches the collected samples to `outcome`.
    ///
    /// Returns a description of the protocol violation if the samples do not fit the outcome.
    pub(crate) fn complete(
        self,
        mut outcome: IterationOutcome,
    ) -> Result<IterationOutcome, String> {
        match outcome.measurement.as_mut() {
            Some(measurement) => measurement.restore_samples(self.samples)?,
            None if !self.samples.is_empty() => {
                return Err(format!(
                    "worker sent samples for {}, which measures nothing",
                    outcome.params.stage()
                ));
            }
            None => {}
        }

        Ok(outcome)
    }
}

/// An [`Error`] in a form that can cross the process boundary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum RemoteError {
    Configuration {
        problem: String,
    },
    Payload {
        thread: String,
        stage: Stage,
        message: String,
    },
    SynchronizationTimeout {
        stage: Stage,
        timeout: Duration,
        missing: Vec<String>,
    },
    UnknownBenchmark {
        name: String,
    },
    Other {
        message: String,
    },
}

impl From<&Error> for RemoteError {
    fn from(error: &Error) -> Self {
        match error {
            Error::Configuration { problem } => Self::Configuration {
                problem: problem.clone(),
            },
            Error::Payload {
                thread,
                stage,
                message,
            } => Self::Payload {
                thread: thread.clone(),
                stage: *stage,
                message: message.clone(),
            },
            Error::SynchronizationTimeout {
                stage,
                timeout,
                missing,
            } => Self::SynchronizationTimeout {
                stage: *stage,
                timeout: *timeout,
                missing: missing.clone(),
            },
            Error::UnknownBenchmark { name } => Self::UnknownBenchmark { name: name.clone() },
            other => Self::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Configuration { problem } => Self::Configuration { problem },
            RemoteError::Payload {
                thread,
                stage,
                message,
            } => Self::Payload {
                thread,
                stage,
                message,
            },
            RemoteError::SynchronizationTimeout {
                stage,
                timeout,
                missing,
            } => Self::SynchronizationTimeout {
                stage,
                timeout,
                missing,
            },
            RemoteError::UnknownBenchmark { name } => Self::UnknownBenchmark { name },
            RemoteError::Other { message } => Self::channel(format!("worker failed: {message}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use std::sync::Arc;

    use super::*;
    use crate::fork::framing::{MAX_FRAME_SIZE, read_frame};
    use crate::{AggregatedResult, IterationTarget, Phase, RawResult};

    fn measured_outcome() -> IterationOutcome {
        let group: Arc<str> = Arc::from("default");
        let params = IterationParams::new(Phase::Measurement, 0, IterationTarget::Count(5));

        IterationOutcome {
            params,
            failures: Vec::new(),
            measurement: Some(AggregatedResult::from_reports(
                0,
                &[Arc::clone(&group)],
                &[
                    (
                        Arc::clone(&group),
                        RawResult::new(3, Duration::from_micros(3), vec![30, 10, 20]),
                    ),
                    (
                        Arc::clone(&group),
                        RawResult::new(2, Duration::from_micros(2), vec![25, 15]),
                    ),
                ],
                &[],
            )),
        }
    }

    /// Reads messages until the iteration result, the way the supervisor does.
    fn read_completed(buffer: Vec<u8>) -> (usize, Result<IterationOutcome, String>) {
        let mut reader = Cursor::new(buffer);
        let mut assembler = SampleAssembler::default();
        let mut chunks = 0;

        loop {
            match read_frame(&mut reader).unwrap() {
                WorkerMessage::Samples { group, samples } => {
                    chunks += 1;
                    assembler.add(group, samples);
                }
                WorkerMessage::IterationResult(IterationReply::Completed(outcome)) => {
                    return (chunks, assembler.complete(outcome));
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[test]
    fn payload_error_survives_the_boundary() {
        let original = Error::Payload {
            thread: "pong#0".to_string(),
            stage: Stage::Iteration {
                phase: Phase::Measurement,
                index: 2,
            },
            message: "boom".to_string(),
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &RemoteError::from(&original)).unwrap();
        let remote: RemoteError = read_frame(&mut Cursor::new(buffer)).unwrap();

        assert_eq!(Error::from(remote).to_string(), original.to_string());
    }

    #[test]
    fn unrepresentable_errors_become_channel_errors() {
        let original = Error::RunTimeout {
            timeout: Duration::from_secs(1),
        };

        let error = Error::from(RemoteError::from(&original));

        assert!(matches!(error, Error::Channel { .. }));
    }

    #[test]
    fn run_iteration_message_carries_params() {
        let params = IterationParams::new(
            Phase::Warmup,
            1,
            IterationTarget::Duration(Duration::from_millis(100)),
        );

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &SupervisorMessage::RunIteration(params)).unwrap();
        let message: SupervisorMessage = read_frame(&mut Cursor::new(buffer)).unwrap();

        let SupervisorMessage::RunIteration(received) = message else {
            panic!("expected RunIteration, got {message:?}");
        };
        assert_eq!(received, params);
    }

    #[test]
    fn completed_iteration_streams_samples_in_chunks() {
        let outcome = measured_outcome();

        let mut buffer = Vec::new();
        write_completed(&mut buffer, outcome.clone(), 2).unwrap();
        let (chunks, received) = read_completed(buffer);

        // Five samples in chunks of two.
        assert_eq!(chunks, 3);
        assert_eq!(received.unwrap(), outcome);
    }

    #[test]
    fn warmup_iteration_sends_no_samples() {
        let params = IterationParams::new(Phase::Warmup, 0, IterationTarget::Count(5));
        let outcome = IterationOutcome {
            params,
            failures: Vec::new(),
            measurement: None,
        };

        let mut buffer = Vec::new();
        write_completed(&mut buffer, outcome.clone(), SAMPLE_CHUNK_LEN).unwrap();
        let (chunks, received) = read_completed(buffer);

        assert_eq!(chunks, 0);
        assert_eq!(received.unwrap(), outcome);
    }

    #[test]
    fn samples_without_measurement_are_rejected() {
        let mut assembler = SampleAssembler::default();
        assembler.add("default".to_string(), vec![1, 2, 3]);

        let outcome = IterationOutcome {
            params: IterationParams::new(Phase::Warmup, 0, IterationTarget::Count(5)),
            failures: Vec::new(),
            measurement: None,
        };

        assert!(assembler.complete(outcome).is_err());
    }

    #[test]
    fn largest_sample_chunk_fits_in_a_frame() {
        let message = WorkerMessage::Samples {
            group: "default".to_string(),
            samples: vec![u64::MAX; SAMPLE_CHUNK_LEN],
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &message).unwrap();

        assert!(buffer.len() < MAX_FRAME_SIZE);
    }
}
