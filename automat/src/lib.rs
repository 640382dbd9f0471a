// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A cooperative event-driven state machine runtime for small systems.
//!
//! `automat` runs a fixed set of state machines on one logical dispatcher:
//! timers fire, events queue, handlers run to completion, and transitions
//! execute with guaranteed EXIT/ENTRY sequencing. Every event and timer
//! record comes from a pre-sized [`mpool`] pool threaded through [`ilist`]
//! intrusive lists, so behavior stays bounded under memory pressure -
//! running out of records is a configuration error and fails fast instead
//! of degrading.
//!
//! ## Model
//!
//! - A **machine** is a [`MachineId`] slot holding its current **handler**,
//!   a plain `fn` representing one state's reaction code.
//! - **Events** are `(machine, event id, payload)` messages, delivered in
//!   FIFO order by [`Scheduler::task`]. Payloads up to pointer width are
//!   stored inline in the record; larger ones are copied to the heap and
//!   strictly accounted.
//! - **Timers** defer an event until a deadline on the platform [`Clock`].
//!   A machine has at most one timer per event id, and all of its timers
//!   are destroyed when it transitions.
//! - Handlers re-enter the framework only through their [`Context`]:
//!   posting, arming timers, requesting a **transition**. After the
//!   handler returns, the framework runs EXIT on the old state, purges the
//!   machine's timers, swaps handlers and runs ENTRY on the new state.
//!
//! ## Example
//!
//! ```rust
//! use automat::{Clock, Config, Context, EventId, MachineId, Scheduler, Ticks};
//!
//! const BLINKER: MachineId = MachineId::new(0);
//! const TICK: EventId = EventId::user(0);
//!
//! fn off(ctx: &mut Context<'_>, event: EventId, _data: &[u8]) {
//!     if event == TICK {
//!         ctx.transition(on);
//!     }
//! }
//!
//! fn on(ctx: &mut Context<'_>, event: EventId, _data: &[u8]) {
//!     if event == EventId::ENTRY {
//!         ctx.start_timer(TICK, Ticks(500));
//!     } else if event == TICK {
//!         ctx.transition(off);
//!     }
//! }
//!
//! // The platform tick source; a real port reads a hardware counter.
//! fn now() -> Ticks {
//!     Ticks(0)
//! }
//!
//! let sched = Scheduler::new(Config::new(1, 4, 2), Clock::new(1000, now));
//! sched.init_handler(BLINKER, off);
//!
//! // off --TICK--> on; entering `on` arms the timer.
//! sched.post(BLINKER, TICK);
//! let until_next = sched.task();
//! assert_eq!(until_next, Some(Ticks(500)));
//! ```
//!
//! ## Concurrency
//!
//! By default the runtime is single-threaded and cooperative; a post from
//! outside a handler with an empty queue dispatches inline on the caller's
//! stack. With the `threaded` feature every post enqueues under the
//! scheduler lock and fires the [`Wake`] port, and a dispatcher thread
//! alternates [`Park::park`] with [`Scheduler::task`]. Handlers never run
//! while the scheduler lock is held in either build.
//!
//! ## Failure semantics
//!
//! Misuse - reserved event ids, wrong-context calls, exhausted pools,
//! corrupted records - is a programming error and panics; see the
//! individual operations for their contracts. "Nothing to do" conditions
//! (empty queue, unknown timer) are ordinary return values.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod clock;
mod config;
mod event;
mod park;
mod sched;
#[cfg(test)]
mod test_util;
mod timer;

pub use clock::{Clock, Ticks};
pub use config::Config;
pub use event::{EventId, INLINE_DATA};
#[cfg(any(test, feature = "std"))]
pub use park::StdPark;
pub use park::{Park, Wake};
pub use sched::{Context, Handler, MachineId, Scheduler};
