use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Accumulator, Mode, TimeUnit};

/// How much of the collected data a [`BenchResult`] is based on.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    /// Every thread of every accepted iteration completed cleanly.
    #[default]
    Full,

    /// Some data was discarded because of thread failures. The score is computed from the
    /// remaining data only and may not be representative.
    Degraded {
        /// How many (thread, iteration) contributions were dropped because the thread failed.
        discarded_threads: u64,

        /// How many whole measurement iterations were dropped.
        skipped_iterations: u64,
    },
}

impl Confidence {
    pub(crate) fn degraded(discarded_threads: u64, skipped_iterations: u64) -> Self {
        if discarded_threads == 0 && skipped_iterations == 0 {
            Self::Full
        } else {
            Self::Degraded {
                discarded_threads,
                skipped_iterations,
            }
        }
    }

    fn counts(self) -> (u64, u64) {
        match self {
            Self::Full => (0, 0),
            Self::Degraded {
                discarded_threads,
                skipped_iterations,
            } => (discarded_threads, skipped_iterations),
        }
    }

    /// Combines the confidence of two results: degradations add up.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let (a_threads, a_iterations) = self.counts();
        let (b_threads, b_iterations) = other.counts();

        Self::degraded(
            a_threads.saturating_add(b_threads),
            a_iterations.saturating_add(b_iterations),
        )
    }
}

/// How scores are derived from an [`Accumulator`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Scoring {
    pub(crate) mode: Mode,
    pub(crate) time_unit: TimeUnit,
    pub(crate) score_percentile: f64,
}

/// The final statistic for one benchmark (or one group of a benchmark).
///
/// Results from separate forks combine with [`merge()`][Self::merge], which re-derives every
/// statistic from the combined raw totals rather than from the already-derived scores.
///
/// # Examples
///
/// ```no_run
/// use lockstep::{BenchmarkRegistry, RunConfig, Runner};
///
/// # let registry = BenchmarkRegistry::new();
/// let report = Runner::new(RunConfig::default()).run(&registry).unwrap();
///
/// for (name, result) in report.results() {
///     println!(
///         "{name}: {:.3} {} over {} samples ({:?})",
///         result.score(),
///         result.score_unit(),
///         result.sample_count(),
///         result.confidence()
///     );
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    mode: Mode,
    time_unit: TimeUnit,
    score_percentile: f64,
    score: f64,
    score_unit: String,
    sample_count: u64,
    percentiles: Option<BTreeMap<String, f64>>,
    confidence: Confidence,
    accumulator: Accumulator,
}

impl BenchResult {
    pub(crate) fn from_accumulator(
        scoring: Scoring,
        accumulator: Accumulator,
        confidence: Confidence,
    ) -> Self {
        let Scoring {
            mode,
            time_unit,
            score_percentile,
        } = scoring;

        let (sample_count, percentiles) = if mode.is_percentile() {
            (
                accumulator.samples().len() as u64,
                Some(accumulator.percentiles(time_unit)),
            )
        } else {
            (accumulator.iterations(), None)
        };

        Self {
            mode,
            time_unit,
            score_percentile,
            score: accumulator.score(mode, time_unit, score_percentile),
            score_unit: time_unit.score_unit(mode),
            sample_count,
            percentiles,
            confidence,
            accumulator,
        }
    }

    /// Combines two results of the same benchmark, e.g. from two forks.
    ///
    /// # Panics
    ///
    /// Panics if the results were scored differently (mode, time unit or score percentile).
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let scoring = self.scoring();
        assert!(
            scoring == other.scoring(),
            "cannot merge results scored differently: {scoring:?} vs {:?}",
            other.scoring()
        );

        Self::from_accumulator(
            scoring,
            self.accumulator.merge(&other.accumulator),
            self.confidence.merge(other.confidence),
        )
    }

    /// Combines any number of results of the same benchmark. Returns `None` if there are none.
    ///
    /// # Panics
    ///
    /// Panics if the results were scored differently.
    pub fn aggregate<'a>(results: impl IntoIterator<Item = &'a Self>) -> Option<Self> {
        results.into_iter().fold(None, |acc: Option<Self>, next| {
            Some(match acc {
                Some(acc) => acc.merge(next),
                None => next.clone(),
            })
        })
    }

    fn scoring(&self) -> Scoring {
        Scoring {
            mode: self.mode,
            time_unit: self.time_unit,
            score_percentile: self.score_percentile,
        }
    }

    /// What the score measures.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The unit the score and the percentiles are expressed in.
    #[must_use]
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// The final statistic. NaN if there was nothing to derive it from.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Unit of the score, e.g. `ops/s` or `ns/op`.
    #[must_use]
    pub fn score_unit(&self) -> &str {
        &self.score_unit
    }

    /// Number of measurement iterations (throughput and average time) or number of samples
    /// (percentile modes) the score is based on.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Standard percentiles keyed by label (`p50`, `p99.9`, ...). Only present in percentile
    /// modes.
    #[must_use]
    pub fn percentiles(&self) -> Option<&BTreeMap<String, f64>> {
        self.percentiles.as_ref()
    }

    /// Whether any data was discarded on the way to this result.
    #[must_use]
    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    /// The raw totals the result was derived from.
    #[must_use]
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use testing::f64_diff_abs;

    use super::*;
    use crate::RawResult;

    fn scoring(mode: Mode) -> Scoring {
        Scoring {
            mode,
            time_unit: TimeUnit::Nanoseconds,
            score_percentile: 50.0,
        }
    }

    fn result(mode: Mode, ops: u64, samples: &[u64]) -> BenchResult {
        let accumulator = Accumulator::from_iteration(&[RawResult::new(
            ops,
            Duration::from_nanos(ops * 10),
            samples.to_vec(),
        )]);

        BenchResult::from_accumulator(scoring(mode), accumulator, Confidence::Full)
    }

    #[test]
    #[expect(
        clippy::float_cmp,
        reason = "we use absolute error, which is the right thing to do"
    )]
    fn additive_mode_counts_iterations() {
        let a = result(Mode::AverageTime, 100, &[]);
        let b = result(Mode::AverageTime, 300, &[]);

        let merged = a.merge(&b);

        assert_eq!(merged.sample_count(), 2);
        assert_eq!(f64_diff_abs(merged.score(), 10.0, 1e-9), 0.0);
        assert_eq!(merged.score_unit(), "ns/op");
        assert!(merged.percentiles().is_none());
    }

    #[test]
    #[expect(
        clippy::float_cmp,
        reason = "we use absolute error, which is the right thing to do"
    )]
    fn percentile_mode_counts_samples() {
        let a = result(Mode::SampleTime, 3, &[10, 20, 30]);
        let b = result(Mode::SampleTime, 2, &[40, 50]);

        let merged = a.merge(&b);

        assert_eq!(merged.sample_count(), 5);
        assert_eq!(f64_diff_abs(merged.score(), 30.0, 1e-9), 0.0);
        assert_eq!(merged.percentiles().unwrap().get("p100"), Some(&50.0));
    }

    #[test]
    fn aggregate_of_nothing_is_none() {
        assert!(BenchResult::aggregate([]).is_none());
    }

    #[test]
    fn aggregate_matches_pairwise_merge() {
        let a = result(Mode::Throughput, 10, &[]);
        let b = result(Mode::Throughput, 20, &[]);
        let c = result(Mode::Throughput, 30, &[]);

        let all = BenchResult::aggregate([&a, &b, &c]).unwrap();

        assert_eq!(all, a.merge(&b).merge(&c));
        assert_eq!(all, a.merge(&b.merge(&c)));
    }

    #[test]
    fn degraded_confidence_is_sticky() {
        let full = result(Mode::Throughput, 10, &[]);
        let degraded = BenchResult::from_accumulator(
            scoring(Mode::Throughput),
            full.accumulator().clone(),
            Confidence::degraded(1, 0),
        );

        assert_eq!(
            full.merge(&degraded).confidence(),
            Confidence::Degraded {
                discarded_threads: 1,
                skipped_iterations: 0
            }
        );
        assert_eq!(full.merge(&full).confidence(), Confidence::Full);
    }

    #[test]
    #[should_panic(expected = "cannot merge results scored differently")]
    fn merging_different_modes_panics() {
        let a = result(Mode::Throughput, 10, &[]);
        let b = result(Mode::AverageTime, 10, &[]);

        _ = a.merge(&b);
    }
}
