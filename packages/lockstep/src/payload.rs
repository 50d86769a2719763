use std::fmt;
use std::sync::Arc;

use crate::{Blackhole, Control, Primitive, ThreadMeta};

/// The unit of work a worker thread invokes repeatedly during an iteration, in one of the
/// supported invocation shapes.
///
/// The shape is resolved once, when the worker thread is set up, so the iteration loop can
/// select the matching invocation wrapper outside the measured hot loop. Values returned by
/// [`Returning`][Self::Returning] payloads are implicitly fed to the thread's [`Blackhole`].
pub enum PayloadKind {
    /// Does not produce a value.
    Void(Box<dyn FnMut(&Control)>),

    /// Produces a value that the harness consumes. Construct via
    /// [`returning()`][Self::returning] or [`returning_primitive()`][Self::returning_primitive].
    Returning(Box<dyn FnMut(&Control, &mut Blackhole)>),

    /// Receives the thread's blackhole and consumes values itself.
    Sink(Box<dyn FnMut(&Control, &mut Blackhole)>),
}

impl PayloadKind {
    /// A payload that does not produce a value.
    pub fn void<F>(f: F) -> Self
    where
        F: FnMut(&Control) + 'static,
    {
        Self::Void(Box::new(f))
    }

    /// A payload whose return value is consumed by the harness after every invocation.
    pub fn returning<T, F>(mut f: F) -> Self
    where
        F: FnMut(&Control) -> T + 'static,
    {
        Self::Returning(Box::new(move |control, blackhole| {
            blackhole.consume_object(f(control));
        }))
    }

    /// A payload returning a primitive, which the harness mixes into the blackhole's
    /// accumulator instead of treating it as an opaque object.
    pub fn returning_primitive<T, F>(mut f: F) -> Self
    where
        T: Primitive,
        F: FnMut(&Control) -> T + 'static,
    {
        Self::Returning(Box::new(move |control, blackhole| {
            blackhole.consume(f(control));
        }))
    }

    /// A payload that consumes its own values through the provided blackhole.
    pub fn sink<F>(f: F) -> Self
    where
        F: FnMut(&Control, &mut Blackhole) + 'static,
    {
        Self::Sink(Box::new(f))
    }

    /// Which invocation shape this payload has.
    #[must_use]
    pub fn shape(&self) -> PayloadShape {
        match self {
            Self::Void(_) => PayloadShape::Void,
            Self::Returning(_) => PayloadShape::Returning,
            Self::Sink(_) => PayloadShape::Sink,
        }
    }
}

impl fmt::Debug for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PayloadKind").field(&self.shape()).finish()
    }
}

/// The invocation shape of a [`PayloadKind`], without the payload itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadShape {
    /// See [`PayloadKind::Void`].
    Void,

    /// See [`PayloadKind::Returning`].
    Returning,

    /// See [`PayloadKind::Sink`].
    Sink,
}

/// Creates the payload of each worker thread in a group.
///
/// The factory is called once on every worker thread before the first iteration, outside of
/// any measurement. It receives the thread's identity so threads can specialize by role (e.g.
/// thread 0 of a group produces while the others consume) and can set up per-thread state that
/// the returned payload closure then owns.
///
/// # Examples
///
/// ```
/// use std::collections::VecDeque;
///
/// use lockstep::{Payload, PayloadKind};
///
/// let payload = Payload::new(|meta| {
///     let mut queue = VecDeque::with_capacity(16);
///     let seed = meta.index_in_group() as u64;
///
///     PayloadKind::returning_primitive(move |_control| {
///         queue.push_back(seed);
///         queue.pop_front().unwrap_or_default()
///     })
/// });
/// # drop(payload);
/// ```
#[derive(Clone, derive_more::Debug)]
pub struct Payload {
    #[debug(ignore)]
    factory: Arc<dyn Fn(&ThreadMeta) -> PayloadKind + Send + Sync>,
}

impl Payload {
    /// Wraps a per-thread payload factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ThreadMeta) -> PayloadKind + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Builds the payload for one worker thread.
    pub(crate) fn instantiate(&self, meta: &ThreadMeta) -> PayloadKind {
        (self.factory)(meta)
    }
}
