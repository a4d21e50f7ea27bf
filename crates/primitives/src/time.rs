//! Timestamp storage units and time-quantum bucketing.
//!
//! Timestamp fields store a signed tick count relative to a per-field epoch;
//! time-quantum fields keep one view per calendar bucket (year, month, day,
//! hour). Both live here so the executor and the schema layer agree on the
//! exact arithmetic.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Resolution of a timestamp field's tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

/// Timestamp (or epoch/value combination) outside the representable window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timestamp out of the representable range")]
pub struct TimeOutOfRange;

/// Unrecognized time unit string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown time unit `{0}`, expected one of s, ms, us, ns")]
pub struct InvalidTimeUnit(pub String);

/// Earliest instant a timestamp field can store, regardless of unit.
pub fn min_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 1).unwrap()
}

/// Latest instant a timestamp field can store, regardless of unit.
pub fn max_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

impl TimeUnit {
    /// Ticks between `epoch` and `t` at this resolution.
    ///
    /// Errors when `t` is outside the global window or the distance from
    /// `epoch` does not fit in 63 bits, which is how nanosecond fields end up
    /// with a narrower usable window.
    pub fn ticks(&self, t: DateTime<Utc>, epoch: DateTime<Utc>) -> Result<i64, TimeOutOfRange> {
        if t < min_timestamp() || t > max_timestamp() {
            return Err(TimeOutOfRange);
        }
        let d = t - epoch;
        match self {
            TimeUnit::Seconds => Ok(d.num_seconds()),
            TimeUnit::Milliseconds => Ok(d.num_milliseconds()),
            TimeUnit::Microseconds => d.num_microseconds().ok_or(TimeOutOfRange),
            TimeUnit::Nanoseconds => d.num_nanoseconds().ok_or(TimeOutOfRange),
        }
    }

    /// The instant `epoch + ticks` at this resolution.
    pub fn from_ticks(&self, ticks: i64, epoch: DateTime<Utc>) -> Result<DateTime<Utc>, TimeOutOfRange> {
        let d = match self {
            TimeUnit::Seconds => Duration::try_seconds(ticks),
            TimeUnit::Milliseconds => Duration::try_milliseconds(ticks),
            TimeUnit::Microseconds => Some(Duration::microseconds(ticks)),
            TimeUnit::Nanoseconds => Some(Duration::nanoseconds(ticks)),
        }
        .ok_or(TimeOutOfRange)?;
        let t = epoch.checked_add_signed(d).ok_or(TimeOutOfRange)?;
        if t < min_timestamp() || t > max_timestamp() {
            return Err(TimeOutOfRange);
        }
        Ok(t)
    }

    /// The usable `[min, max]` tick bounds for a field with this unit and
    /// epoch: the global window clamped to what 63 bits can express.
    pub fn tick_bounds(&self, epoch: DateTime<Utc>) -> (i64, i64) {
        let min = self.ticks(min_timestamp(), epoch).unwrap_or(i64::MIN + 1);
        let max = self.ticks(max_timestamp(), epoch).unwrap_or(i64::MAX);
        (min, max)
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Microseconds => "us",
            TimeUnit::Nanoseconds => "ns",
        })
    }
}

impl FromStr for TimeUnit {
    type Err = InvalidTimeUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(TimeUnit::Seconds),
            "ms" => Ok(TimeUnit::Milliseconds),
            "us" | "µs" => Ok(TimeUnit::Microseconds),
            "ns" => Ok(TimeUnit::Nanoseconds),
            other => Err(InvalidTimeUnit(other.to_owned())),
        }
    }
}

/// One calendar granularity of a time quantum, coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Year,
    Month,
    Day,
    Hour,
}

/// A non-empty, contiguous subset of "YMDH" naming which bucket views a
/// time-quantum field maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeQuantum {
    year: bool,
    month: bool,
    day: bool,
    hour: bool,
}

/// Malformed time quantum string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time quantum `{0}`, expected an in-order subset of YMDH")]
pub struct InvalidTimeQuantum(pub String);

impl TimeQuantum {
    /// Granularities this quantum maintains, coarse to fine.
    pub fn granularities(&self) -> SmallVec<[Granularity; 4]> {
        let mut out = SmallVec::new();
        if self.year {
            out.push(Granularity::Year);
        }
        if self.month {
            out.push(Granularity::Month);
        }
        if self.day {
            out.push(Granularity::Day);
        }
        if self.hour {
            out.push(Granularity::Hour);
        }
        out
    }

    fn finest(&self) -> Granularity {
        *self.granularities().last().unwrap()
    }

    /// View-name suffixes a write at `t` lands in, one per granularity.
    pub fn views_for_time(&self, t: DateTime<Utc>) -> SmallVec<[String; 4]> {
        self.granularities().iter().map(|g| view_suffix(*g, t)).collect()
    }

    /// The minimal set of view-name suffixes covering `[from, to)`.
    ///
    /// Both endpoints are truncated down to the finest granularity the
    /// quantum maintains; remainders below that resolution are not
    /// addressable by any view.
    pub fn views_for_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
        let finest = self.finest();
        let mut t = truncate(from, finest);
        let to = truncate(to, finest);
        let units = self.granularities();
        let mut out = Vec::new();
        while t < to {
            // Greedy: take the coarsest bucket that starts here and fits.
            let g = units
                .iter()
                .copied()
                .find(|g| aligned(t, *g) && step(t, *g) <= to)
                .unwrap_or(finest);
            out.push(view_suffix(g, t));
            t = step(t, g);
        }
        out
    }
}

fn view_suffix(g: Granularity, t: DateTime<Utc>) -> String {
    match g {
        Granularity::Year => t.format("%Y").to_string(),
        Granularity::Month => t.format("%Y%m").to_string(),
        Granularity::Day => t.format("%Y%m%d").to_string(),
        Granularity::Hour => t.format("%Y%m%d%H").to_string(),
    }
}

fn truncate(t: DateTime<Utc>, g: Granularity) -> DateTime<Utc> {
    let (y, m, d, h) = (t.year(), t.month(), t.day(), t.hour());
    let (m, d, h) = match g {
        Granularity::Year => (1, 1, 0),
        Granularity::Month => (m, 1, 0),
        Granularity::Day => (m, d, 0),
        Granularity::Hour => (m, d, h),
    };
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn aligned(t: DateTime<Utc>, g: Granularity) -> bool {
    match g {
        Granularity::Year => t.month() == 1 && t.day() == 1 && t.hour() == 0,
        Granularity::Month => t.day() == 1 && t.hour() == 0,
        Granularity::Day => t.hour() == 0,
        Granularity::Hour => true,
    }
}

fn step(t: DateTime<Utc>, g: Granularity) -> DateTime<Utc> {
    match g {
        Granularity::Year => Utc.with_ymd_and_hms(t.year() + 1, 1, 1, 0, 0, 0).unwrap(),
        Granularity::Month => {
            let (y, m) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
            Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap()
        }
        Granularity::Day => t + Duration::days(1),
        Granularity::Hour => t + Duration::hours(1),
    }
}

impl fmt::Display for TimeQuantum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.year {
            f.write_str("Y")?;
        }
        if self.month {
            f.write_str("M")?;
        }
        if self.day {
            f.write_str("D")?;
        }
        if self.hour {
            f.write_str("H")?;
        }
        Ok(())
    }
}

impl FromStr for TimeQuantum {
    type Err = InvalidTimeQuantum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut q = TimeQuantum { year: false, month: false, day: false, hour: false };
        let mut last = 0u8;
        for c in s.chars() {
            let rank = match c {
                'Y' => 1,
                'M' => 2,
                'D' => 3,
                'H' => 4,
                _ => return Err(InvalidTimeQuantum(s.to_owned())),
            };
            if rank <= last {
                return Err(InvalidTimeQuantum(s.to_owned()));
            }
            last = rank;
            match c {
                'Y' => q.year = true,
                'M' => q.month = true,
                'D' => q.day = true,
                _ => q.hour = true,
            }
        }
        if last == 0 {
            return Err(InvalidTimeQuantum(s.to_owned()));
        }
        Ok(q)
    }
}
