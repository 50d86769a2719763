#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Microbenchmark execution harness with synchronized thread groups and forked worker isolation.
//!
//! Given a set of benchmarks, each a [`Payload`] plus a [`BenchmarkDescriptor`] saying how to run
//! it, the harness runs warmup iterations (discarded) and then measurement iterations (kept) on
//! one or more long-lived worker threads, optionally split into named groups that play different
//! roles. The samples of all clean threads are combined into one [`BenchResult`] per benchmark.
//!
//! The core functionality includes:
//! - [`Payload`] and [`PayloadKind`] - The operation being measured, created once per worker
//!   thread from its [`ThreadMeta`].
//! - [`Blackhole`] - Keeps computed values observable so the compiler cannot elide the work.
//! - [`Control`] - Per-iteration stop flag shared by every thread of the iteration.
//! - [`Runner`] - Drives benchmarks through their phases, in process or in worker processes.
//! - [`BenchResult`] - The final statistic, combinable across forks.
//!
//! # Operating principles
//!
//! ## Synchronized iterations
//!
//! Worker threads are created once per run and reused for every iteration. Unless a descriptor
//! opts out, all threads of all groups are released together at the start of every iteration.
//! An iteration ends after a target number of invocations per thread, or when the target
//! duration since the shared release has elapsed. No invocation begins after the stop flag is
//! set, but an invocation in progress always completes.
//!
//! ## Forks
//!
//! With a fork count of one or more, every benchmark runs in freshly launched worker processes,
//! one after another, so that state accumulated by one fork (JIT-like caches, allocator state,
//! a crash) cannot affect another. The worker process is the current executable by default and
//! must call [`serve_if_worker()`] at the start of `main()`.
//!
//! ## Failures
//!
//! A panic in a payload is caught and attributed to its thread. What happens next is decided
//! by [`PartialFailurePolicy`] and [`RunConfig::fail_on_error()`]: abort the fork, skip the
//! iteration or discard only the failed threads. Any discarded data is visible in
//! [`BenchResult::confidence()`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use lockstep::{
//!     Blackhole, BenchmarkDescriptor, BenchmarkRegistry, Mode, Payload, PayloadKind, PhaseSpec,
//!     RunConfig, Runner, TimeUnit,
//! };
//!
//! let mut registry = BenchmarkRegistry::new();
//!
//! registry
//!     .register(
//!         BenchmarkDescriptor::builder("vec_push")
//!             .mode(Mode::AverageTime)
//!             .time_unit(TimeUnit::Nanoseconds)
//!             .threads(2)
//!             .payload(Payload::new(|_meta| {
//!                 let mut items = Vec::with_capacity(1024);
//!                 PayloadKind::sink(move |_control, blackhole: &mut Blackhole| {
//!                     if items.len() == 1024 {
//!                         items.clear();
//!                     }
//!                     items.push(42_u64);
//!                     blackhole.consume(items.len());
//!                 })
//!             }))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let config = RunConfig::builder()
//!     .forks(0)
//!     .warmup(PhaseSpec::timed(1, Duration::from_millis(10)))
//!     .measurement(PhaseSpec::timed(3, Duration::from_millis(10)))
//!     .build()
//!     .unwrap();
//!
//! let report = Runner::new(config).run(&registry).unwrap();
//!
//! for (name, result) in report.results() {
//!     println!("{name}: {:.1} {}", result.score(), result.score_unit());
//! }
//! ```

mod aggregate;
mod barrier;
mod blackhole;
mod config;
mod control;
mod coordinator;
mod descriptor;
mod error;
mod fork;
mod iteration;
mod params;
mod payload;
mod registry;
mod result;
mod runner;
mod thread_meta;
mod timer;

pub use aggregate::*;
pub use blackhole::*;
pub use config::*;
pub use control::*;
pub use descriptor::*;
pub use error::Error;
pub use fork::{WorkerLaunch, fork_index, serve_if_worker};
pub use iteration::RawResult;
pub use params::*;
pub use payload::*;
pub use registry::*;
pub use result::{BenchResult, Confidence};
pub use runner::*;
pub use thread_meta::*;
