use std::num::NonZero;
use std::sync::Arc;

/// Identity of one worker thread within a benchmark run.
///
/// Passed to the payload factory when a worker thread is set up, so that threads can specialize
/// their behavior by role, e.g. thread 0 of the "producer" group publishes while every thread
/// of the "consumer" group drains.
///
/// # Examples
///
/// ```
/// use lockstep::{Payload, PayloadKind};
///
/// let payload = Payload::new(|meta| {
///     if meta.index_in_group() == 0 {
///         PayloadKind::void(|_control| { /* leader work */ })
///     } else {
///         PayloadKind::void(|_control| { /* follower work */ })
///     }
/// });
/// # drop(payload);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadMeta {
    group_name: Arc<str>,
    group_index: usize,
    index_in_group: usize,
    threads_in_group: NonZero<usize>,
    global_index: usize,
    total_threads: NonZero<usize>,
}

impl ThreadMeta {
    pub(crate) fn new(
        group_name: Arc<str>,
        group_index: usize,
        index_in_group: usize,
        threads_in_group: NonZero<usize>,
        global_index: usize,
        total_threads: NonZero<usize>,
    ) -> Self {
        debug_assert!(index_in_group < threads_in_group.get());
        debug_assert!(global_index < total_threads.get());

        Self {
            group_name,
            group_index,
            index_in_group,
            threads_in_group,
            global_index,
            total_threads,
        }
    }

    /// Name of the group the thread belongs to.
    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub(crate) fn group_name_shared(&self) -> &Arc<str> {
        &self.group_name
    }

    /// Index of the thread's group in declaration order, starting from 0.
    ///
    /// Groups with zero threads still occupy an index.
    #[must_use]
    pub fn group_index(&self) -> usize {
        self.group_index
    }

    /// Index of the thread within its group, starting from 0.
    #[must_use]
    pub fn index_in_group(&self) -> usize {
        self.index_in_group
    }

    /// How many threads the thread's group has.
    #[must_use]
    pub fn threads_in_group(&self) -> NonZero<usize> {
        self.threads_in_group
    }

    /// Index of the thread across all groups, starting from 0.
    #[must_use]
    pub fn global_index(&self) -> usize {
        self.global_index
    }

    /// How many worker threads participate in the run across all groups.
    #[must_use]
    pub fn total_threads(&self) -> NonZero<usize> {
        self.total_threads
    }

    /// Short label identifying the thread in logs and errors, in `group#index` form.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}#{}", self.group_name, self.index_in_group)
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn label_combines_group_and_index() {
        let meta = ThreadMeta::new(Arc::from("pong"), 1, 1, nz!(2), 1, nz!(2));

        assert_eq!(meta.label(), "pong#1");
        assert_eq!(meta.group_name(), "pong");
        assert_eq!(meta.group_index(), 1);
        assert_eq!(meta.threads_in_group(), nz!(2));
        assert_eq!(meta.global_index(), 1);
        assert_eq!(meta.total_threads(), nz!(2));
    }
}
