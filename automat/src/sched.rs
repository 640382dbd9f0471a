// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::vec;
use core::fmt;
use core::ptr::NonNull;

use ilist::List;
use mpool::Pool;
use spin::Mutex;

#[cfg(feature = "threaded")]
use alloc::sync::Arc;

use crate::clock::{Clock, Ticks};
use crate::config::Config;
use crate::event::{Event, EventId, HeapStats};
#[cfg(feature = "threaded")]
use crate::park::Wake;
use crate::timer::Timer;

/// Identifies one state machine instance.
///
/// Machine ids form a closed space sized by
/// [`Config::machines`][crate::Config]; using an id outside that range is
/// a precondition violation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MachineId(u16);

impl MachineId {
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One state's reaction code.
///
/// A handler receives the [`Context`] through which it may re-enter the
/// framework (post, arm timers, request a transition), the event id and
/// the payload bytes. Handlers run to completion; blocking inside one
/// stalls the whole dispatcher.
pub type Handler = fn(&mut Context<'_>, EventId, &[u8]);

// Owner tags stamped into pool blocks for post-mortem attribution.
const TAG_POSTED_EVENT: u8 = 0x11;
const TAG_TIMER: u8 = 0x22;
const TAG_TIMER_EVENT: u8 = 0x33;

#[derive(Copy, Clone, Default)]
struct MachineState {
    current: Option<Handler>,
    pending: Option<Handler>,
}

struct Core {
    states: Box<[MachineState]>,
    /// The machine whose handler is currently executing, if any.
    active: Option<MachineId>,
    events: List<Event>,
    timers: List<Timer>,
    event_pool: Pool<Event>,
    timer_pool: Pool<Timer>,
    stats: HeapStats,
    last_tick: Ticks,
}

/// The cooperative dispatcher.
///
/// One `Scheduler` owns the machine table, the pending-event queue, the
/// armed-timer list and the fixed pools backing both. Handlers are invoked
/// one at a time, run-to-completion; the internal lock is released around
/// every handler call, so handlers re-enter the framework through their
/// [`Context`] without ever holding it.
pub struct Scheduler {
    core: Mutex<Core>,
    clock: Clock,
    #[cfg(feature = "threaded")]
    wake: Option<Arc<dyn Wake>>,
}

#[cfg(feature = "threaded")]
static_assertions::assert_impl_all!(Scheduler: Send, Sync);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Mode {
    Entry,
    Exit,
    Event,
}

/// The reentrancy surface handed to state handlers.
///
/// A `Context` always belongs to the machine whose handler is executing;
/// operations that the framework restricts to handler context (timers,
/// transitions) only exist here, which makes calling them from outside a
/// handler impossible rather than a runtime error.
pub struct Context<'a> {
    sched: &'a Scheduler,
    machine: MachineId,
    mode: Mode,
}

// === impl Core ===

impl Core {
    fn new(config: Config) -> Self {
        assert!(config.machines > 0, "at least one machine is required");
        Self {
            states: vec![MachineState::default(); usize::from(config.machines)]
                .into_boxed_slice(),
            active: None,
            events: List::new(config.max_events),
            timers: List::new(config.max_timers),
            event_pool: Pool::new(config.max_events),
            timer_pool: Pool::new(config.max_timers),
            stats: HeapStats::new(config.max_events),
            last_tick: Ticks::ZERO,
        }
    }

    fn state_mut(&mut self, machine: MachineId) -> &mut MachineState {
        let index = machine.index();
        assert!(index < self.states.len(), "machine id out of range");
        &mut self.states[index]
    }

    /// Allocates an event record together with its payload copy.
    fn alloc_event(
        &mut self,
        machine: MachineId,
        id: EventId,
        data: &[u8],
        owner: u8,
    ) -> NonNull<Event> {
        let payload = self.stats.alloc(data);
        self.event_pool.acquire(Event::new(machine, id, payload), owner)
    }

    /// Frees an event record and its payload.
    ///
    /// # Safety
    ///
    /// `event` must be an outstanding block of `event_pool` that is not a
    /// member of any list.
    unsafe fn free_event(&mut self, event: NonNull<Event>) {
        // Safety: per the caller contract.
        let event = unsafe { self.event_pool.release(event) };
        self.stats.free(event.payload);
    }

    /// Finds the armed timer for (`machine`, `id`), if any.
    ///
    /// Walks the raw links so the returned pointer is the stored one (with
    /// provenance over its whole pool slot), not one re-derived from a
    /// shared borrow.
    fn find_timer(&self, machine: MachineId, id: EventId) -> Option<NonNull<Timer>> {
        let mut cur = self.timers.front();
        while let Some(ptr) = cur {
            // Safety: list members are live pool blocks, as is the inner
            // event of an armed timer.
            let found = unsafe {
                let timer = ptr.as_ref();
                let event = timer.event.as_ref();
                event.machine == machine && event.id == id
            };
            if found {
                return Some(ptr);
            }
            // Safety: `ptr` is a member of the timer list.
            cur = unsafe { self.timers.next_of(ptr) };
        }
        None
    }

    /// Stops and frees the armed timer for (`machine`, `id`); a no-op when
    /// none exists.
    fn stop_timer(&mut self, machine: MachineId, id: EventId) {
        if let Some(ptr) = self.find_timer(machine, id) {
            tracing::trace!(machine = machine.index(), event = ?id, "timer stopped");
            // Safety: `ptr` is a member of `timers` and, with its inner
            // event, an outstanding block of the respective pool.
            unsafe {
                let shell = self.timers.remove(ptr);
                let timer = self.timer_pool.release(shell);
                self.free_event(timer.event);
            }
        }
    }

    /// Destroys every timer armed by `machine`, payloads included.
    fn purge_timers(&mut self, machine: MachineId) {
        let Core {
            timers,
            timer_pool,
            event_pool,
            stats,
            ..
        } = self;
        let mut cursor = timers.cursor_front_mut();
        while let Some(timer) = cursor.current() {
            // Safety: the inner event block stays valid while its timer is
            // armed.
            let owner = unsafe { timer.event.as_ref().machine };
            if owner == machine {
                let shell = cursor.remove_current().expect("cursor is on an element");
                // Safety: just unlinked; shell and inner event are
                // outstanding blocks of their pools.
                unsafe {
                    let timer = timer_pool.release(shell);
                    let event = event_pool.release(timer.event);
                    stats.free(event.payload);
                }
            } else {
                cursor.move_next();
            }
        }
    }

    /// Migrates every expired timer's event onto the event queue and frees
    /// the shell.
    fn expire_timers(&mut self, now: Ticks) {
        let Core {
            timers,
            events,
            timer_pool,
            ..
        } = self;
        let mut cursor = timers.cursor_front_mut();
        while let Some(timer) = cursor.current() {
            if timer.deadline > now {
                cursor.move_next();
                continue;
            }
            let shell = cursor.remove_current().expect("cursor is on an element");
            // Safety: just unlinked; an outstanding block of `timer_pool`.
            let timer = unsafe { timer_pool.release(shell) };
            tracing::trace!(deadline = timer.deadline.0, "timer expired");
            events.push_front(timer.event);
        }
    }

    fn next_deadline(&self) -> Option<Ticks> {
        self.timers.iter().map(|timer| timer.deadline).min()
    }

    /// Returns every queued event and armed timer to the pools, payloads
    /// included.
    fn drain(&mut self) {
        while let Some(shell) = self.timers.pop_front() {
            // Safety: just unlinked; shell and inner event are outstanding
            // blocks of their pools.
            unsafe {
                let timer = self.timer_pool.release(shell);
                let event = self.event_pool.release(timer.event);
                self.stats.free(event.payload);
            }
        }
        while let Some(record) = self.events.pop_back() {
            // Safety: just unlinked; an outstanding block of `event_pool`.
            unsafe { self.free_event(record) };
        }
    }
}

// === impl Scheduler ===

impl Scheduler {
    /// Creates a scheduler sized by `config`. All machines start without a
    /// handler; bring each up with [`Scheduler::init_handler`].
    #[must_use]
    pub fn new(config: Config, clock: Clock) -> Self {
        Self {
            core: Mutex::new(Core::new(config)),
            clock,
            #[cfg(feature = "threaded")]
            wake: None,
        }
    }

    /// The tick source this scheduler schedules against.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Installs the wake signal fired after every post, releasing a
    /// dispatcher blocked in [`Park::park`][crate::Park::park].
    #[cfg(feature = "threaded")]
    pub fn set_wake(&mut self, wake: Arc<dyn Wake>) {
        self.wake = Some(wake);
    }

    /// Heap-copy counters `(mallocs, frees)` for oversize payloads.
    ///
    /// The pair balances whenever the scheduler is idle.
    pub fn heap_stats(&self) -> (u64, u64) {
        self.core.lock().stats.counters()
    }

    /// Installs `initial` as the current state of `machine` and
    /// synchronously delivers `ENTRY` to it in the caller's context.
    /// Subsequent dispatch is confined to [`Scheduler::task`].
    ///
    /// # Panics
    ///
    /// Panics when called from inside a handler or with an out-of-range
    /// machine id.
    pub fn init_handler(&self, machine: MachineId, initial: Handler) {
        {
            let mut core = self.core.lock();
            assert!(
                core.active.is_none(),
                "init_handler may not be called from a handler"
            );
            core.state_mut(machine).current = Some(initial);
            core.active = Some(machine);
        }
        tracing::trace!(machine = machine.index(), "initial entry");
        let mut ctx = Context {
            sched: self,
            machine,
            mode: Mode::Entry,
        };
        initial(&mut ctx, EventId::ENTRY, &[]);
        self.core.lock().active = None;
    }

    /// Posts a user event with no payload. See [`Scheduler::post_data`].
    pub fn post(&self, to: MachineId, event: EventId) {
        self.post_data(to, event, &[]);
    }

    /// Posts `event` to machine `to`, copying `data` into the event.
    ///
    /// In the default single-threaded build the event is dispatched inline
    /// on the caller's stack iff no handler is currently running and the
    /// queue is empty; otherwise it is enqueued in FIFO order. With the
    /// `threaded` feature the event is always enqueued under the scheduler
    /// lock and the wake signal is fired; dispatch then happens only
    /// inside [`Scheduler::task`].
    ///
    /// # Panics
    ///
    /// Panics for the reserved `ENTRY`/`EXIT` ids, for an out-of-range or
    /// uninitialized machine, and when the event pool is exhausted.
    pub fn post_data(&self, to: MachineId, event: EventId, data: &[u8]) {
        assert!(event.is_user(), "ENTRY/EXIT are reserved for the framework");

        cfg_if::cfg_if! {
            if #[cfg(feature = "threaded")] {
                {
                    let mut core = self.core.lock();
                    assert!(
                        core.state_mut(to).current.is_some(),
                        "machine has no handler installed"
                    );
                    let record = core.alloc_event(to, event, data, TAG_POSTED_EVENT);
                    core.events.push_front(record);
                }
                tracing::trace!(machine = to.index(), event = ?event, "event queued");
                if let Some(wake) = &self.wake {
                    wake.wake();
                }
            } else {
                let mut core = self.core.lock();
                assert!(
                    core.state_mut(to).current.is_some(),
                    "machine has no handler installed"
                );
                if core.active.is_some() || !core.events.is_empty() {
                    let record = core.alloc_event(to, event, data, TAG_POSTED_EVENT);
                    core.events.push_front(record);
                    tracing::trace!(machine = to.index(), event = ?event, "event queued");
                } else {
                    core.active = Some(to);
                    drop(core);
                    tracing::trace!(machine = to.index(), event = ?event, "inline dispatch");
                    self.process_event(to, event, data);
                    self.core.lock().active = None;
                }
            }
        }
    }

    /// One dispatcher pass.
    ///
    /// Migrates every timer whose deadline has passed onto the event
    /// queue, drains the queue in FIFO order (running the transition
    /// protocol after each handler), and returns the time until the next
    /// *unfired* deadline - measured from this pass's entry timestamp - or
    /// `None` when no timers remain armed.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a handler.
    pub fn task(&self) -> Option<Ticks> {
        let mut core = self.core.lock();
        assert!(
            core.active.is_none(),
            "task may not be called from a state handler"
        );

        let current = self.clock.now();
        let now = if current < core.last_tick {
            tracing::warn!("time went backwards!");
            core.last_tick
        } else {
            core.last_tick = current;
            current
        };

        core.expire_timers(now);

        // Drain the queue, re-popping under a fresh lock after every
        // handler so no list position survives a user call.
        while let Some(record) = core.events.pop_back() {
            // Safety: the record is unlinked and its block stays
            // outstanding until `free_event` below; handlers cannot reach
            // it.
            let (machine, event) = unsafe {
                let record = record.as_ref();
                (record.machine, record.id)
            };
            core.active = Some(machine);
            drop(core);

            // Safety: see above; the payload bytes live in the record (or
            // its heap copy) and nothing mutates them during the call.
            let data = unsafe { record.as_ref().payload.as_slice() };
            self.process_event(machine, event, data);

            core = self.core.lock();
            core.active = None;
            // Safety: still an outstanding, unlinked block.
            unsafe { core.free_event(record) };
        }

        core.next_deadline()
            .map(|deadline| deadline.saturating_sub(now))
    }

    /// Tears the runtime down, verifying the resource contracts.
    ///
    /// Every queued event and armed timer is destroyed (payloads
    /// included), then the heap accounting must balance and both pools
    /// must be full again. Dropping a `Scheduler` performs the same
    /// draining without the verification.
    ///
    /// # Panics
    ///
    /// Panics if a payload copy or a record leaked.
    pub fn shutdown(self) {
        {
            let mut core = self.core.lock();
            core.drain();
            let (mallocs, frees) = core.stats.counters();
            assert!(
                core.stats.balanced(),
                "payload copies leaked ({mallocs} allocated, {frees} freed)"
            );
            assert!(
                core.event_pool.is_full() && core.timer_pool.is_full(),
                "event or timer records leaked"
            );
        }
    }

    /// Runs the current handler of `machine` for one event, then performs
    /// any requested transition: EXIT on the old state, purge of all of
    /// the machine's timers, handler swap, ENTRY on the new state.
    ///
    /// The core lock must not be held and `active` must already name
    /// `machine`.
    fn process_event(&self, machine: MachineId, event: EventId, data: &[u8]) {
        let current = {
            let mut core = self.core.lock();
            debug_assert_eq!(core.active, Some(machine));
            core.state_mut(machine)
                .current
                .expect("machine has no handler installed")
        };

        tracing::trace!(machine = machine.index(), event = ?event, "dispatch");
        let mut ctx = Context {
            sched: self,
            machine,
            mode: Mode::Event,
        };
        current(&mut ctx, event, data);

        let pending = {
            let mut core = self.core.lock();
            core.state_mut(machine).pending.take()
        };
        if let Some(next) = pending {
            tracing::trace!(machine = machine.index(), "transition");

            let mut ctx = Context {
                sched: self,
                machine,
                mode: Mode::Exit,
            };
            current(&mut ctx, EventId::EXIT, &[]);

            {
                let mut core = self.core.lock();
                core.purge_timers(machine);
                core.state_mut(machine).current = Some(next);
            }

            let mut ctx = Context {
                sched: self,
                machine,
                mode: Mode::Entry,
            };
            next(&mut ctx, EventId::ENTRY, &[]);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.core.get_mut().drain();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Scheduler");
        debug.field("clock", &self.clock);
        if let Some(core) = self.core.try_lock() {
            debug
                .field("queued_events", &core.events.len())
                .field("armed_timers", &core.timers.len());
        }
        debug.finish_non_exhaustive()
    }
}

// === impl Context ===

impl Context<'_> {
    /// The machine this handler invocation belongs to.
    #[must_use]
    pub fn machine(&self) -> MachineId {
        self.machine
    }

    /// Requests a transition to `next` once the current handler returns.
    ///
    /// No code runs at the call itself; the framework performs
    /// EXIT -> timer purge -> ENTRY after the handler body completes.
    ///
    /// # Panics
    ///
    /// Panics during ENTRY or EXIT processing, when a transition was
    /// already requested in this dispatch, or when `next` is the current
    /// handler (self-transitions are forbidden).
    pub fn transition(&mut self, next: Handler) {
        assert!(
            self.mode == Mode::Event,
            "transition may not be requested during ENTRY or EXIT"
        );
        let mut core = self.sched.core.lock();
        let state = core.state_mut(self.machine);
        let current = state.current.expect("machine has no handler installed");
        assert!(
            !core::ptr::fn_addr_eq(next, current),
            "self-transitions are not allowed"
        );
        assert!(
            state.pending.is_none(),
            "transition already requested in this dispatch"
        );
        state.pending = Some(next);
    }

    /// Arms the timer delivering `event` to this machine `interval` ticks
    /// from now. See [`Context::start_timer_data`].
    pub fn start_timer(&mut self, event: EventId, interval: Ticks) {
        self.start_timer_data(event, interval, &[]);
    }

    /// Arms a timer with a payload.
    ///
    /// An armed timer of this machine with the same event id is stopped
    /// and freed first, so at most one timer per (machine, event id)
    /// exists. The machine's timers are all destroyed when it transitions.
    ///
    /// # Panics
    ///
    /// Panics for the reserved `ENTRY`/`EXIT` ids and when the timer or
    /// event pool is exhausted.
    pub fn start_timer_data(&mut self, event: EventId, interval: Ticks, data: &[u8]) {
        assert!(event.is_user(), "ENTRY/EXIT are reserved for the framework");
        let mut core = self.sched.core.lock();
        core.stop_timer(self.machine, event);

        let deadline = self.sched.clock.now() + interval;
        let record = core.alloc_event(self.machine, event, data, TAG_TIMER_EVENT);
        let shell = core.timer_pool.acquire(Timer::new(record, deadline), TAG_TIMER);
        core.timers.push_front(shell);
        tracing::trace!(
            machine = self.machine.index(),
            event = ?event,
            deadline = deadline.0,
            "timer armed"
        );
    }

    /// Disarms the timer for `event`; a no-op when none is armed.
    pub fn stop_timer(&mut self, event: EventId) {
        let mut core = self.sched.core.lock();
        core.stop_timer(self.machine, event);
    }

    /// Posts a user event with no payload. See [`Context::post_data`].
    pub fn post(&mut self, to: MachineId, event: EventId) {
        self.sched.post(to, event);
    }

    /// Posts an event from handler context.
    ///
    /// Events posted from inside a handler are always appended to the
    /// queue behind anything already pending - they are never dispatched
    /// before the current handler returns.
    pub fn post_data(&mut self, to: MachineId, event: EventId, data: &[u8]) {
        self.sched.post_data(to, event, data);
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("machine", &self.machine)
            .field("mode", &self.mode)
            .finish()
    }
}
