// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wake-signal and parking ports for cross-thread posting.
//!
//! In the threaded build the dispatcher thread alternates
//! `park(next_timeout)` / [`task`][crate::Scheduler::task] while producer
//! threads post events; every post fires the scheduler's [`Wake`] so the
//! dispatcher re-enters `task` promptly.

use crate::clock::Ticks;

/// The post-side wake signal: releases a dispatcher blocked in
/// [`Park::park`].
pub trait Wake: Send + Sync {
    fn wake(&self);
}

/// The dispatcher-side wait primitive.
///
/// The timeout is advisory and expressed in scheduler ticks; on expiry no
/// error is signalled and spurious early returns are harmless, because the
/// dispatcher re-derives the next deadline from
/// [`task`][crate::Scheduler::task] on every pass. `None` means "no timer
/// pending, wait for a wake".
pub trait Park {
    fn park(&self, timeout: Option<Ticks>);
}

#[cfg(any(test, feature = "std"))]
mod std_park {
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use super::{Park, Wake};
    use crate::clock::Ticks;

    /// A [`Park`]/[`Wake`] pair built on a mutex and condition variable.
    ///
    /// Wakes are latched: a [`Wake::wake`] that arrives while the
    /// dispatcher is *not* parked makes the next [`Park::park`] return
    /// immediately, so no post is ever missed.
    #[derive(Debug)]
    pub struct StdPark {
        pending: Mutex<bool>,
        cvar: Condvar,
        ticks_per_sec: u64,
    }

    impl StdPark {
        /// `ticks_per_sec` must match the scheduler clock so tick timeouts
        /// convert to wall time correctly.
        #[must_use]
        pub fn new(ticks_per_sec: u64) -> Self {
            Self {
                pending: Mutex::new(false),
                cvar: Condvar::new(),
                ticks_per_sec,
            }
        }

        fn to_duration(&self, ticks: Ticks) -> Duration {
            let nanos = u128::from(ticks.0) * 1_000_000_000 / u128::from(self.ticks_per_sec);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    impl Park for StdPark {
        fn park(&self, timeout: Option<Ticks>) {
            let pending = self.pending.lock().expect("parker lock poisoned");
            let mut pending = match timeout {
                Some(ticks) => {
                    self.cvar
                        .wait_timeout_while(pending, self.to_duration(ticks), |signaled| !*signaled)
                        .expect("parker lock poisoned")
                        .0
                }
                None => self
                    .cvar
                    .wait_while(pending, |signaled| !*signaled)
                    .expect("parker lock poisoned"),
            };
            *pending = false;
        }
    }

    impl Wake for StdPark {
        fn wake(&self) {
            *self.pending.lock().expect("parker lock poisoned") = true;
            self.cvar.notify_one();
        }
    }

}

#[cfg(any(test, feature = "std"))]
pub use std_park::StdPark;
