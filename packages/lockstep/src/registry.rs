use crate::error::Result;
use crate::{BenchmarkDescriptor, Error};

/// The set of benchmarks a binary knows how to run, in registration order.
///
/// Both the supervising process and every worker process build the same registry; the
/// supervisor selects a benchmark in the worker by name.
///
/// # Examples
///
/// ```
/// use lockstep::{BenchmarkDescriptor, BenchmarkRegistry, Payload, PayloadKind};
///
/// let mut registry = BenchmarkRegistry::new();
///
/// registry
///     .register(
///         BenchmarkDescriptor::builder("noop")
///             .payload(Payload::new(|_| PayloadKind::void(|_| {})))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// assert!(registry.get("noop").is_some());
/// ```
#[derive(Debug, Default)]
pub struct BenchmarkRegistry {
    benchmarks: Vec<BenchmarkDescriptor>,
}

impl BenchmarkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a benchmark to the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a benchmark with the same name is already registered.
    pub fn register(&mut self, descriptor: BenchmarkDescriptor) -> Result<()> {
        if self.get(descriptor.name()).is_some() {
            return Err(Error::configuration(format!(
                "benchmark '{}' is registered more than once",
                descriptor.name()
            )));
        }

        self.benchmarks.push(descriptor);
        Ok(())
    }

    /// Looks up a benchmark by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BenchmarkDescriptor> {
        self.benchmarks.iter().find(|b| b.name() == name)
    }

    /// Iterates over the benchmarks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkDescriptor> {
        self.benchmarks.iter()
    }

    /// Number of registered benchmarks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    /// Whether no benchmarks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }
}
