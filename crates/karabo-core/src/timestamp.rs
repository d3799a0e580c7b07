//! Time stamps: wall clock plus train id.
//!
//! A [`Timestamp`] pairs an [`Epochstamp`] (seconds since the Unix epoch and
//! attosecond fraction) with a [`Trainstamp`]. Train ids are not read from a
//! clock; they are extrapolated from the last timing tick recorded in the
//! process-global [`TimeMixin`].
//!
//! ## Extrapolation
//!
//! With a reference `(tid0, sec0, frac0, period_us)` the train id of an epoch
//! `t` is `tid0 + floor((t - ref) / period)` for `t >= ref`. Before the
//! reference it is `tid0 - floor((ref - t) / period) - 1`, clamped at zero.
//! Without a reference (period 0) every train id is 0.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{const_rwlock, RwLock};

use crate::error::CoreResult;
use crate::hash::Attributes;

/// Attoseconds per second.
pub const ATTOSEC_PER_SEC: u64 = 1_000_000_000_000_000_000;

/// Attoseconds per microsecond.
pub const ATTOSEC_PER_MICROSEC: u64 = 1_000_000_000_000;

/// Attribute names used when a timestamp is attached to a hash node.
pub const ATTR_SEC: &str = "sec";
/// See [`ATTR_SEC`].
pub const ATTR_FRAC: &str = "frac";
/// See [`ATTR_SEC`].
pub const ATTR_TID: &str = "tid";

// =============================================================================
// Epochstamp
// =============================================================================

/// Seconds since the Unix epoch with attosecond fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Epochstamp {
    sec: u64,
    frac: u64,
}

impl Epochstamp {
    /// Build from parts. A fraction of a second or more is carried into `sec`.
    pub fn new(sec: u64, frac: u64) -> Self {
        Self {
            sec: sec + frac / ATTOSEC_PER_SEC,
            frac: frac % ATTOSEC_PER_SEC,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Convert from a chrono time; times before the epoch clamp to zero.
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        let secs = dt.timestamp();
        if secs < 0 {
            return Self::default();
        }
        Self::new(
            secs as u64,
            u64::from(dt.timestamp_subsec_nanos()) * 1_000_000_000,
        )
    }

    /// Whole seconds.
    pub fn sec(&self) -> u64 {
        self.sec
    }

    /// Attoseconds past `sec`.
    pub fn frac(&self) -> u64 {
        self.frac
    }

    /// Total attoseconds since the epoch.
    pub fn as_attos(&self) -> u128 {
        u128::from(self.sec) * u128::from(ATTOSEC_PER_SEC) + u128::from(self.frac)
    }

    /// Absolute distance to `other` in microseconds, truncated.
    pub fn elapsed_micros(&self, other: &Epochstamp) -> u128 {
        self.as_attos().abs_diff(other.as_attos()) / u128::from(ATTOSEC_PER_MICROSEC)
    }

    /// ISO 8601 with microsecond precision.
    pub fn to_iso8601(&self) -> String {
        let nanos = (self.frac / 1_000_000_000) as u32;
        match Utc.timestamp_opt(self.sec as i64, nanos).single() {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            None => format!("{}.{:018}", self.sec, self.frac),
        }
    }
}

impl PartialOrd for Epochstamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Epochstamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.frac).cmp(&(other.sec, other.frac))
    }
}

impl fmt::Display for Epochstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Train id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Trainstamp(pub u64);

/// Epoch plus train id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    /// Wall-clock part.
    pub epoch: Epochstamp,
    /// Train part.
    pub train: Trainstamp,
}

impl Timestamp {
    /// Pair an epoch with a train id.
    pub fn new(epoch: Epochstamp, train: Trainstamp) -> Self {
        Self { epoch, train }
    }

    /// Now, with the train id extrapolated by the global [`TimeMixin`].
    pub fn now() -> Self {
        TimeMixin::timestamp_at(Epochstamp::now())
    }

    /// Seconds.
    pub fn sec(&self) -> u64 {
        self.epoch.sec
    }

    /// Attoseconds.
    pub fn frac(&self) -> u64 {
        self.epoch.frac
    }

    /// Train id.
    pub fn tid(&self) -> u64 {
        self.train.0
    }

    /// Write `sec`, `frac` and `tid` attributes.
    pub fn to_attributes(&self, attrs: &mut Attributes) {
        attrs.set(ATTR_SEC, self.epoch.sec);
        attrs.set(ATTR_FRAC, self.epoch.frac);
        attrs.set(ATTR_TID, self.train.0);
    }

    /// True if all three timestamp attributes are present.
    pub fn present_in(attrs: &Attributes) -> bool {
        attrs.has(ATTR_SEC) && attrs.has(ATTR_FRAC) && attrs.has(ATTR_TID)
    }

    /// Read back the attributes written by [`Timestamp::to_attributes`].
    pub fn from_attributes(attrs: &Attributes) -> CoreResult<Self> {
        let sec: u64 = attrs.get_as(ATTR_SEC)?;
        let frac: u64 = attrs.get_as(ATTR_FRAC)?;
        let tid: u64 = attrs.get_as(ATTR_TID)?;
        Ok(Self::new(Epochstamp::new(sec, frac), Trainstamp(tid)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tid {})", self.epoch, self.train.0)
    }
}

// =============================================================================
// TimeMixin
// =============================================================================

/// Last timing tick received by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeReference {
    /// Train id of the tick.
    pub tid: u64,
    /// Epoch of the tick.
    pub epoch: Epochstamp,
    /// Train period in microseconds, 0 if no tick was received yet.
    pub period_us: u64,
}

static REFERENCE: RwLock<TimeReference> = const_rwlock(TimeReference {
    tid: 0,
    epoch: Epochstamp { sec: 0, frac: 0 },
    period_us: 0,
});

/// Process-global train id extrapolation.
pub struct TimeMixin;

impl TimeMixin {
    /// Record a timing tick.
    pub fn set_reference(tid: u64, sec: u64, frac: u64, period_us: u64) {
        *REFERENCE.write() = TimeReference {
            tid,
            epoch: Epochstamp::new(sec, frac),
            period_us,
        };
    }

    /// Forget the reference; train ids become 0 again.
    pub fn reset() {
        *REFERENCE.write() = TimeReference::default();
    }

    /// Current reference.
    pub fn reference() -> TimeReference {
        *REFERENCE.read()
    }

    /// Train id for `epoch`.
    pub fn train_id_at(epoch: &Epochstamp) -> u64 {
        let reference = Self::reference();
        extrapolate(&reference, epoch)
    }

    /// Full timestamp for `epoch`.
    pub fn timestamp_at(epoch: Epochstamp) -> Timestamp {
        Timestamp::new(epoch, Trainstamp(Self::train_id_at(&epoch)))
    }
}

fn extrapolate(reference: &TimeReference, epoch: &Epochstamp) -> u64 {
    if reference.period_us == 0 {
        return 0;
    }
    let periods = epoch.elapsed_micros(&reference.epoch) / u128::from(reference.period_us);
    let periods = u64::try_from(periods).unwrap_or(u64::MAX);
    if reference.epoch <= *epoch {
        reference.tid.saturating_add(periods)
    } else {
        let tid = reference.tid.checked_sub(periods).and_then(|t| t.checked_sub(1));
        if tid.is_none() {
            tracing::warn!(
                epoch = %epoch,
                reference = %reference.epoch,
                tid = reference.tid,
                period_us = reference.period_us,
                "Epoch lies before train id zero, using train id 0"
            );
        }
        tid.unwrap_or(0)
    }
}
