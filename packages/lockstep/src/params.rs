use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether an iteration is discarded (warmup) or contributes to the result (measurement).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Lets the execution environment reach a steady state. Samples are discarded.
    #[display("warmup")]
    Warmup,

    /// Samples contribute to the final result.
    #[display("measurement")]
    Measurement,
}

/// Where in a fork's lifecycle something happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Worker threads were being set up and their payloads created.
    #[display("setup")]
    Setup,

    /// An iteration was executing.
    #[display("{phase} iteration {index}")]
    Iteration {
        /// The phase of the iteration.
        phase: Phase,

        /// Index of the iteration within its phase.
        index: u32,
    },
}

/// How long a single iteration runs on every participating thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationTarget {
    /// Run until the wall-clock budget has elapsed since the threads were released.
    Duration(Duration),

    /// Invoke the payload exactly this many times on every thread.
    Count(u64),
}

impl IterationTarget {
    /// The wall-clock budget, if this is a duration-based target.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(duration) => Some(*duration),
            Self::Count(_) => None,
        }
    }
}

/// How many iterations a phase consists of and how long each one runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    iterations: u32,
    target: IterationTarget,
}

impl PhaseSpec {
    /// A phase of `iterations` iterations, each running for `duration`.
    #[must_use]
    pub fn timed(iterations: u32, duration: Duration) -> Self {
        Self {
            iterations,
            target: IterationTarget::Duration(duration),
        }
    }

    /// A phase of `iterations` iterations, each invoking the payload `count` times per thread.
    #[must_use]
    pub fn counted(iterations: u32, count: u64) -> Self {
        Self {
            iterations,
            target: IterationTarget::Count(count),
        }
    }

    /// Number of iterations in the phase. Zero is legal and skips the phase.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The target every iteration of the phase runs to.
    #[must_use]
    pub fn target(&self) -> IterationTarget {
        self.target
    }

    pub(crate) fn params(&self, phase: Phase, index: u32) -> IterationParams {
        IterationParams {
            phase,
            index,
            target: self.target,
        }
    }
}

/// Governs one synchronized iteration across all participating threads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IterationParams {
    phase: Phase,
    index: u32,
    target: IterationTarget,
}

impl IterationParams {
    /// Creates the parameters for iteration `index` of `phase`.
    #[must_use]
    pub fn new(phase: Phase, index: u32, target: IterationTarget) -> Self {
        Self {
            phase,
            index,
            target,
        }
    }

    /// The phase this iteration belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the iteration within its phase, starting from 0.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// When the iteration ends.
    #[must_use]
    pub fn target(&self) -> IterationTarget {
        self.target
    }

    /// The stage this iteration represents, for error reporting.
    #[must_use]
    pub fn stage(&self) -> Stage {
        Stage::Iteration {
            phase: self.phase,
            index: self.index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_spec_produces_params_in_phase() {
        let spec = PhaseSpec::counted(3, 1000);
        let params = spec.params(Phase::Warmup, 2);

        assert_eq!(params.phase(), Phase::Warmup);
        assert_eq!(params.index(), 2);
        assert_eq!(params.target(), IterationTarget::Count(1000));
        assert_eq!(params.target().duration(), None);
    }

    #[test]
    fn timed_target_exposes_duration() {
        let spec = PhaseSpec::timed(1, Duration::from_millis(250));

        assert_eq!(
            spec.target().duration(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn stage_displays_position() {
        let params = IterationParams::new(Phase::Measurement, 3, IterationTarget::Count(1));

        assert_eq!(params.stage().to_string(), "measurement iteration 3");
        assert_eq!(Stage::Setup.to_string(), "setup");
    }

    #[test]
    fn phase_displays_lowercase() {
        assert_eq!(Phase::Warmup.to_string(), "warmup");
        assert_eq!(Phase::Measurement.to_string(), "measurement");
    }
}
