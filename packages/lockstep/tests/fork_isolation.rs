//! Runs benchmarks in real worker processes, launched by re-executing this test binary.
//!
//! This test binary has its own `main()` because every worker process must check for its role
//! before doing anything else.

use std::process;
use std::time::{Duration, Instant};

use lockstep::{
    BenchmarkDescriptor, BenchmarkRegistry, Error, Mode, Payload, PayloadKind, Phase, PhaseSpec,
    RunConfig, Runner, Stage, fork_index, serve_if_worker,
};

fn main() {
    let registry = registry();

    if let Some(outcome) = serve_if_worker(&registry) {
        process::exit(i32::from(outcome.is_err()));
    }

    let tests: [(&str, fn(&BenchmarkRegistry)); 8] = [
        ("forks_are_combined", forks_are_combined),
        ("crashed_fork_is_isolated", crashed_fork_is_isolated),
        ("late_crash_keeps_completed_iterations", late_crash_keeps_completed_iterations),
        ("forked_samples_match_in_process", forked_samples_match_in_process),
        ("hung_worker_is_abandoned", hung_worker_is_abandoned),
        ("run_timeout_kills_worker", run_timeout_kills_worker),
        ("setup_panic_crosses_process_boundary", setup_panic_crosses_process_boundary),
        ("unknown_benchmark_in_worker", unknown_benchmark_in_worker),
    ];

    for (name, test) in tests {
        let started = Instant::now();
        test(&registry);
        println!("test {name} ... ok ({:?})", started.elapsed());
    }
}

fn registry() -> BenchmarkRegistry {
    let mut registry = BenchmarkRegistry::new();

    registry
        .register(
            BenchmarkDescriptor::builder("steady")
                .threads(2)
                .payload(Payload::new(|_| PayloadKind::returning(|_| 7_u64.pow(3))))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("crashes_in_second_fork")
                .payload(Payload::new(|_| {
                    let doomed = fork_index() == Some(1);
                    PayloadKind::void(move |control| {
                        if doomed && control.params().phase() == Phase::Measurement {
                            process::abort();
                        }
                    })
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("crashes_late_in_second_fork")
                .payload(Payload::new(|_| {
                    let doomed = fork_index() == Some(1);
                    PayloadKind::void(move |control| {
                        let params = control.params();
                        if doomed && params.phase() == Phase::Measurement && params.index() == 1 {
                            process::abort();
                        }
                    })
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("many_samples")
                .mode(Mode::SampleTime)
                .threads(48)
                .payload(Payload::new(|_| PayloadKind::returning_primitive(|_| 7_u64)))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("hangs")
                .threads(2)
                .iteration_timeout(Duration::from_millis(300))
                .payload(Payload::new(|meta| {
                    let hangs = meta.index_in_group() == 1;
                    PayloadKind::void(move |control| {
                        if hangs && control.params().phase() == Phase::Measurement {
                            loop {
                                std::thread::sleep(Duration::from_secs(1));
                            }
                        }
                    })
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("slow")
                .payload(Payload::new(|_| {
                    PayloadKind::void(|_| std::thread::sleep(Duration::from_millis(50)))
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
        .register(
            BenchmarkDescriptor::builder("setup_panics")
                .payload(Payload::new(|_| -> PayloadKind {
                    panic!("cannot set up in a worker");
                }))
                .build()
                .unwrap(),
        )
        .unwrap();

    registry
}

fn two_forks() -> RunConfig {
    RunConfig::builder()
        .forks(2)
        .warmup(PhaseSpec::counted(1, 10))
        .measurement(PhaseSpec::counted(3, 10))
        .handshake_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

fn descriptor<'a>(registry: &'a BenchmarkRegistry, name: &str) -> &'a BenchmarkDescriptor {
    registry.get(name).unwrap()
}

fn forks_are_combined(registry: &BenchmarkRegistry) {
    let report = Runner::new(two_forks())
        .run_benchmark(descriptor(registry, "steady"))
        .unwrap();

    assert_eq!(report.fork_results().count(), 2);
    assert!(report.fork_failures().is_empty());

    // Two forks, three iterations, two threads, ten invocations.
    let accumulator = report.result().accumulator();
    assert_eq!(accumulator.ops(), 2 * 3 * 2 * 10);
    assert_eq!(accumulator.iterations(), 6);
}

fn crashed_fork_is_isolated(registry: &BenchmarkRegistry) {
    let report = Runner::new(two_forks())
        .run_benchmark(descriptor(registry, "crashes_in_second_fork"))
        .unwrap();

    assert_eq!(report.fork_results().count(), 1);
    assert_eq!(report.result().accumulator().ops(), 3 * 10);

    let failures = report.fork_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].fork(), 1);
    assert!(
        matches!(failures[0].error(), Error::Channel { .. }),
        "unexpected error: {:?}",
        failures[0].error()
    );
    assert!(failures[0].partial().is_none());
}

fn late_crash_keeps_completed_iterations(registry: &BenchmarkRegistry) {
    let report = Runner::new(two_forks())
        .run_benchmark(descriptor(registry, "crashes_late_in_second_fork"))
        .unwrap();

    assert_eq!(report.fork_results().count(), 1);
    assert_eq!(report.result().accumulator().ops(), 3 * 10);

    let failures = report.fork_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].fork(), 1);
    assert!(
        matches!(failures[0].error(), Error::Channel { .. }),
        "unexpected error: {:?}",
        failures[0].error()
    );

    // Measurement iteration 0 completed before the worker died in iteration 1.
    let partial = failures[0].partial().expect("completed iteration is kept");
    assert_eq!(partial.sample_count(), 1);
    assert_eq!(partial.accumulator().ops(), 10);
}

fn forked_samples_match_in_process(registry: &BenchmarkRegistry) {
    let config = |forks| {
        RunConfig::builder()
            .forks(forks)
            .warmup(PhaseSpec::counted(0, 1))
            .measurement(PhaseSpec::counted(1, 120_000))
            .handshake_timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    };

    let many_samples = descriptor(registry, "many_samples");

    let in_process = Runner::new(config(0)).run_benchmark(many_samples).unwrap();
    let forked = Runner::new(config(1)).run_benchmark(many_samples).unwrap();

    assert!(forked.fork_failures().is_empty());
    assert_eq!(forked.result().accumulator().ops(), 48 * 120_000);

    // Enough samples to span several chunks on the way back from the worker.
    let samples = forked.result().sample_count();
    assert!(samples > 48 * 32_768, "only {samples} samples");
    assert_eq!(samples, in_process.result().sample_count());
}

fn hung_worker_is_abandoned(registry: &BenchmarkRegistry) {
    let config = RunConfig::builder()
        .forks(1)
        .warmup(PhaseSpec::counted(1, 1))
        .measurement(PhaseSpec::counted(1, 1))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = Runner::new(config).run_benchmark(descriptor(registry, "hangs"));

    let Err(Error::AllForksFailed { failures, .. }) = result else {
        panic!("expected the only fork to fail");
    };

    let Error::SynchronizationTimeout { missing, stage, .. } = failures[0].error() else {
        panic!("unexpected error: {:?}", failures[0].error());
    };
    assert_eq!(missing, &["default#1"]);
    assert_eq!(
        *stage,
        Stage::Iteration {
            phase: Phase::Measurement,
            index: 0
        }
    );
    assert!(started.elapsed() < Duration::from_secs(30));
}

fn run_timeout_kills_worker(registry: &BenchmarkRegistry) {
    let config = RunConfig::builder()
        .forks(1)
        .warmup(PhaseSpec::counted(0, 1))
        .measurement(PhaseSpec::counted(1, 1000))
        .run_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = Runner::new(config).run_benchmark(descriptor(registry, "slow"));

    let Err(Error::AllForksFailed { failures, .. }) = result else {
        panic!("expected the only fork to fail");
    };

    assert!(
        matches!(failures[0].error(), Error::RunTimeout { .. }),
        "unexpected error: {:?}",
        failures[0].error()
    );
    assert!(started.elapsed() < Duration::from_secs(30));
}

fn setup_panic_crosses_process_boundary(registry: &BenchmarkRegistry) {
    let result = Runner::new(two_forks())
        .run_benchmark(descriptor(registry, "setup_panics"));

    let Err(Error::AllForksFailed { failures, .. }) = result else {
        panic!("expected every fork to fail");
    };
    assert_eq!(failures.len(), 2);

    for failure in &failures {
        let Error::Payload { stage, message, .. } = failure.error() else {
            panic!("unexpected error: {:?}", failure.error());
        };
        assert_eq!(*stage, Stage::Setup);
        assert!(message.contains("cannot set up in a worker"));
    }
}

fn unknown_benchmark_in_worker(_registry: &BenchmarkRegistry) {
    // Registered only in the supervising process, so worker processes do not know it.
    let local_only = BenchmarkDescriptor::builder("local_only")
        .payload(Payload::new(|_| PayloadKind::void(|_| {})))
        .build()
        .unwrap();

    let result = Runner::new(two_forks()).run_benchmark(&local_only);

    let Err(Error::AllForksFailed { failures, .. }) = result else {
        panic!("expected every fork to fail");
    };

    assert!(
        matches!(failures[0].error(), Error::UnknownBenchmark { name } if name == "local_only"),
        "unexpected error: {:?}",
        failures[0].error()
    );
}
