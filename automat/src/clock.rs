// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Add;
use core::time::Duration;

/// A monotonic tick count, in units of the owning [`Clock`]'s tick rate.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ticks", self.0)
    }
}

/// The platform tick source the runtime schedules against.
///
/// The port contract is a single monotonic counter function running at
/// `ticks_per_sec`; everything else (timer intervals, park timeouts, the
/// `task` return value) is expressed in its units.
#[derive(Copy, Clone)]
pub struct Clock {
    name: &'static str,
    ticks_per_sec: u64,
    now: fn() -> Ticks,
}

impl Clock {
    /// Creates a clock from its tick rate and counter function.
    #[must_use]
    pub const fn new(ticks_per_sec: u64, now: fn() -> Ticks) -> Self {
        Self {
            name: "<unnamed clock>",
            ticks_per_sec,
            now,
        }
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the hardware time source backing
    /// the counter function.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Returns this `Clock`'s name, if it was given one using
    /// [`Clock::named`].
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn ticks_per_sec(&self) -> u64 {
        self.ticks_per_sec
    }

    /// Reads the current tick count.
    #[inline]
    pub fn now(&self) -> Ticks {
        (self.now)()
    }

    /// Converts a duration into this clock's tick units (truncating).
    #[must_use]
    pub const fn ticks_for(&self, duration: Duration) -> Ticks {
        let nanos = duration.as_nanos();
        Ticks((nanos * self.ticks_per_sec as u128 / 1_000_000_000) as u64)
    }
}

#[cfg(any(test, feature = "std"))]
impl Clock {
    /// A millisecond-resolution clock backed by `std::time::Instant`,
    /// anchored at its first use in the process.
    #[must_use]
    pub fn std_millis() -> Clock {
        fn now() -> Ticks {
            use std::sync::OnceLock;
            use std::time::Instant;

            static ANCHOR: OnceLock<Instant> = OnceLock::new();
            let anchor = *ANCHOR.get_or_init(Instant::now);
            Ticks(u64::try_from(anchor.elapsed().as_millis()).unwrap_or(u64::MAX))
        }

        Clock::new(1000, now).named("std monotonic clock")
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("ticks_per_sec", &self.ticks_per_sec)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {} ticks/s", self.name, self.ticks_per_sec)
    }
}
