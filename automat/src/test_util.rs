// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test helpers: a manually advanced tick source and tracing setup.

use core::cell::Cell;

use tracing_subscriber::util::SubscriberInitExt;

use crate::clock::{Clock, Ticks};

std::thread_local! {
    static NOW: Cell<u64> = const { Cell::new(0) };
}

/// A thread-local, manually advanced tick source.
///
/// Each test thread gets its own timeline; calling this resets it to zero.
pub(crate) fn mock_clock() -> Clock {
    fn now() -> Ticks {
        Ticks(NOW.with(Cell::get))
    }

    NOW.with(|now| now.set(0));
    Clock::new(1000, now).named("mock test clock")
}

/// Advances the thread's mock timeline.
pub(crate) fn advance(ticks: u64) {
    NOW.with(|now| now.set(now.get() + ticks));
}

/// Installs a fmt subscriber for the current test; keep the guard alive.
pub(crate) fn trace_init() -> impl Drop {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}
