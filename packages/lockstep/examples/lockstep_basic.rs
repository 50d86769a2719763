//! Measures a few small operations in two forked worker processes and prints the results.
//!
//! Set `RUST_LOG=lockstep=debug` to see what the harness is doing.

use std::collections::VecDeque;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lockstep::{
    BenchmarkDescriptor, BenchmarkRegistry, Blackhole, Mode, Payload, PayloadKind, PhaseSpec,
    RunConfig, Runner, TimeUnit, serve_if_worker,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lockstep=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = registry();

    // Worker processes are this same executable, launched again by the runner.
    if let Some(outcome) = serve_if_worker(&registry) {
        if let Err(e) = &outcome {
            eprintln!("worker failed: {e}");
        }
        process::exit(i32::from(outcome.is_err()));
    }

    let config = RunConfig::builder()
        .forks(2)
        .warmup(PhaseSpec::timed(2, Duration::from_millis(200)))
        .measurement(PhaseSpec::timed(3, Duration::from_millis(200)))
        .build()
        .expect("configuration is valid");

    let report = match Runner::new(config).run(&registry) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("run failed: {e}");
            process::exit(1);
        }
    };

    for (name, result) in report.results() {
        println!(
            "{name:<28} {:>14.3} {:<8} ({} samples, {:?})",
            result.score(),
            result.score_unit(),
            result.sample_count(),
            result.confidence()
        );

        if let Some(percentiles) = result.percentiles() {
            for (label, value) in percentiles {
                println!("{:<28} {label:>8} {value:>10.1}", "");
            }
        }
    }

    for (name, error) in report.failures() {
        println!("{name:<28} FAILED: {error}");
    }
}

fn registry() -> BenchmarkRegistry {
    let mut registry = BenchmarkRegistry::new();

    let benchmarks = [
        BenchmarkDescriptor::builder("format_u64")
            .mode(Mode::AverageTime)
            .time_unit(TimeUnit::Nanoseconds)
            .payload(Payload::new(|meta| {
                let mut value = meta.global_index() as u64;
                PayloadKind::returning(move |_| {
                    value = value.wrapping_add(1);
                    value.to_string()
                })
            }))
            .build(),
        BenchmarkDescriptor::builder("shared_counter")
            .threads(4)
            .payload(Payload::new({
                let counter = Arc::new(AtomicU64::new(0));
                move |_| {
                    let counter = Arc::clone(&counter);
                    PayloadKind::returning_primitive(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed)
                    })
                }
            }))
            .build(),
        BenchmarkDescriptor::builder("queue_roles")
            .mode(Mode::SampleTime)
            .time_unit(TimeUnit::Nanoseconds)
            .group(
                "writer",
                1,
                Payload::new(|_| {
                    let mut queue = VecDeque::with_capacity(64);
                    PayloadKind::sink(move |_, blackhole: &mut Blackhole| {
                        if queue.len() == 64 {
                            queue.clear();
                        }
                        queue.push_back(7_u32);
                        blackhole.consume(queue.len());
                    })
                }),
            )
            .group(
                "reader",
                2,
                Payload::new(|_| {
                    let data = vec![3_u32; 64];
                    PayloadKind::returning_primitive(move |_| data.iter().sum::<u32>())
                }),
            )
            .build(),
    ];

    for descriptor in benchmarks {
        registry
            .register(descriptor.expect("descriptor is valid"))
            .expect("benchmark names are unique");
    }

    registry
}
