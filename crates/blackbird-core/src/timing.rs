//! Timing primitives shared by the clock, the wait scheduler and the timers.
//!
//! - [`BeatTime`] - Q16.16 fixed-point beat position
//! - [`Millis`] - millisecond timestamps derived from the sample counter
//! - [`SampleClock`] - conversion from the sample counter to milliseconds

/// Milliseconds since the sample counter started.
pub type Millis = u64;

/// Fixed-point beat representation with 16 fractional bits.
///
/// The raw value is widened to 64 bits so beat positions never wrap during a
/// session; the fractional resolution is exactly 1/65536 of a beat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BeatTime {
    raw: i64,
}

impl BeatTime {
    /// Number of fractional bits.
    pub const FRAC_BITS: u32 = 16;
    /// Raw value of one beat.
    pub const SCALE: i64 = 1 << Self::FRAC_BITS;

    /// Zero beat time constant.
    pub const ZERO: BeatTime = BeatTime { raw: 0 };
    /// One whole beat.
    pub const ONE: BeatTime = BeatTime { raw: Self::SCALE };

    /// Create a BeatTime from its raw Q16.16 value.
    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self { raw }
    }

    /// Create a BeatTime from a whole number of beats.
    #[inline]
    pub const fn from_whole(beats: i64) -> Self {
        Self {
            raw: beats.saturating_mul(Self::SCALE),
        }
    }

    /// Create a BeatTime from a floating-point beat value (rounded to nearest).
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            raw: (value * Self::SCALE as f64).round() as i64,
        }
    }

    /// The raw Q16.16 value.
    #[inline]
    pub const fn raw(self) -> i64 {
        self.raw
    }

    /// Convert to a floating-point beat value.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.raw as f64 / Self::SCALE as f64
    }

    /// Whole beats, rounded toward negative infinity.
    #[inline]
    pub const fn whole(self) -> i64 {
        self.raw >> Self::FRAC_BITS
    }

    /// Smallest multiple of `step` that is strictly greater than `self`.
    ///
    /// `step` must be positive.
    #[inline]
    pub fn next_multiple_of(self, step: BeatTime) -> BeatTime {
        debug_assert!(step.raw > 0);
        let rem = self.raw.rem_euclid(step.raw);
        Self {
            raw: self.raw - rem + step.raw,
        }
    }
}

impl std::ops::Add for BeatTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw.saturating_add(rhs.raw),
        }
    }
}

impl std::ops::AddAssign for BeatTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub for BeatTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            raw: self.raw.saturating_sub(rhs.raw),
        }
    }
}

impl From<f64> for BeatTime {
    fn from(value: f64) -> Self {
        BeatTime::from_float(value)
    }
}

impl From<BeatTime> for f64 {
    fn from(value: BeatTime) -> Self {
        value.to_float()
    }
}

impl std::fmt::Display for BeatTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.to_float())
    }
}

/// Convert a duration in seconds to whole milliseconds, rounding to nearest.
///
/// Negative and NaN inputs map to zero.
#[inline]
pub fn seconds_to_ms(seconds: f64) -> u64 {
    let ms = (seconds * 1000.0).round();
    if ms >= 1.0 {
        ms as u64
    } else {
        0
    }
}

/// Derives the millisecond counter from the sample counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleClock {
    sample_rate: u32,
}

impl SampleClock {
    /// Create a sample clock for the given rate. A zero rate is clamped to 1 Hz.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
        }
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Milliseconds elapsed at the given sample count (truncated).
    #[inline]
    pub fn ms_at(&self, sample_count: u64) -> Millis {
        ((sample_count as u128 * 1000) / self.sample_rate as u128) as Millis
    }

    /// Number of samples in the given number of milliseconds.
    #[inline]
    pub fn samples_in(&self, ms: Millis) -> u64 {
        ms.saturating_mul(self.sample_rate as u64) / 1000
    }
}
