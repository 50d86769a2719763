use std::hint::black_box;
use std::ptr;

/// Multiplier and increment of the linear congruential generator that decides when the
/// accumulator escapes to memory.
const TICK_MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const TICK_INCREMENT: u64 = 1_442_695_040_888_963_407;

/// Constants of the calibrated busy loop behind [`Blackhole::consume_cpu()`].
const CPU_MULTIPLIER: u64 = 0x5_DEEC_E66D;
const CPU_INCREMENT: u64 = 0xB;
const CPU_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// A sink that consumes values produced by benchmark payloads so the compiler cannot prove
/// them dead and eliminate the work that produced them.
///
/// Every worker thread owns its own blackhole. Primitive values are mixed into an accumulator
/// with a data-dependent update; every so often (on a pseudo-random tick whose probability
/// halves each time it fires) the accumulator is written out through an optimization barrier,
/// which prevents the compiler from treating the accumulator itself as dead.
///
/// # Examples
///
/// ```
/// use lockstep::Blackhole;
///
/// let mut blackhole = Blackhole::new();
///
/// for i in 0..1000_u64 {
///     blackhole.consume(i * i);
/// }
///
/// blackhole.consume_object(vec![1, 2, 3]);
/// blackhole.consume_slice(&[1.0_f64, 2.0]);
///
/// // Burn a roughly fixed amount of processor time.
/// Blackhole::consume_cpu(100);
/// ```
#[derive(Debug)]
pub struct Blackhole {
    accumulator: u64,
    tick: u64,
    tick_mask: u64,
    #[allow(dead_code, reason = "write-only destination for the escaping accumulator")]
    escaped: u64,
}

impl Blackhole {
    /// Creates a blackhole with a randomly seeded tick generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accumulator: rand::random(),
            tick: rand::random(),
            tick_mask: 1,
            escaped: 0,
        }
    }

    /// Consumes a primitive value.
    #[inline]
    pub fn consume<T: Primitive>(&mut self, value: T) {
        self.mix(value.to_bits());
    }

    /// Consumes an arbitrary value, which is dropped after it has been observed.
    #[inline]
    pub fn consume_object<T>(&mut self, value: T) {
        let value = black_box(value);
        self.mix(ptr::from_ref(&value).addr() as u64);
        drop(value);
    }

    /// Consumes a slice of primitive values.
    ///
    /// Only the slice identity and its boundary elements are mixed in; the payload is expected
    /// to have already paid for producing the contents.
    #[inline]
    pub fn consume_slice<T: Primitive>(&mut self, values: &[T]) {
        let values = black_box(values);
        self.mix(values.len() as u64);

        if let (Some(first), Some(last)) = (values.first(), values.last()) {
            self.mix(first.to_bits() ^ last.to_bits().rotate_left(32));
        }
    }

    /// Spends approximately `tokens` units of processor time in a loop the compiler cannot
    /// remove. The cost per token is roughly constant on a given machine, which makes this
    /// useful for simulating payloads of a configurable weight.
    #[inline(never)]
    pub fn consume_cpu(tokens: u64) {
        let mut t = black_box(tokens);

        for i in (1..=tokens).rev() {
            t = t.wrapping_add(
                t.wrapping_mul(CPU_MULTIPLIER)
                    .wrapping_add(CPU_INCREMENT)
                    .wrapping_add(i)
                    & CPU_MASK,
            );
        }

        black_box(t);
    }

    #[inline]
    fn mix(&mut self, bits: u64) {
        self.accumulator = self.accumulator.rotate_left(5) ^ bits;

        self.tick = self
            .tick
            .wrapping_mul(TICK_MULTIPLIER)
            .wrapping_add(TICK_INCREMENT);

        if self.tick & self.tick_mask == 0 {
            self.escaped = black_box(self.accumulator);
            self.tick_mask = (self.tick_mask << 1) | 1;
        }
    }
}

impl Default for Blackhole {
    fn default() -> Self {
        Self::new()
    }
}

/// A primitive value that a [`Blackhole`] can mix into its accumulator.
pub trait Primitive: Copy {
    /// The value's bits, widened to 64 bits.
    fn to_bits(self) -> u64;
}

macro_rules! impl_primitive_lossless {
    ($($t:ty),*) => {
        $(
            impl Primitive for $t {
                #[inline]
                fn to_bits(self) -> u64 {
                    u64::from(self)
                }
            }
        )*
    };
}

macro_rules! impl_primitive_signed {
    ($($t:ty => $u:ty),*) => {
        $(
            impl Primitive for $t {
                #[inline]
                fn to_bits(self) -> u64 {
                    u64::from(self as $u)
                }
            }
        )*
    };
}

impl_primitive_lossless!(u8, u16, u32, u64, bool, char);
impl_primitive_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

impl Primitive for usize {
    #[inline]
    fn to_bits(self) -> u64 {
        self as u64
    }
}

impl Primitive for isize {
    #[inline]
    fn to_bits(self) -> u64 {
        self as usize as u64
    }
}

impl Primitive for f32 {
    #[inline]
    fn to_bits(self) -> u64 {
        u64::from(self.to_bits())
    }
}

impl Primitive for f64 {
    #[inline]
    fn to_bits(self) -> u64 {
        self.to_bits()
    }
}
