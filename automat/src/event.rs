// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;
use core::ptr::NonNull;

use ilist::{Linked, Links};

use crate::sched::MachineId;

/// Identifies an event within a machine's closed event set.
///
/// The ids [`EventId::ENTRY`] and [`EventId::EXIT`] are reserved for the
/// framework's transition protocol; posting them is a precondition
/// violation. Application events are laid out with [`EventId::user`],
/// which is `const`-constructible so a closed enumeration can be spelled
/// as constants:
///
/// ```rust
/// use automat::EventId;
///
/// const CONNECTED: EventId = EventId::user(0);
/// const TIMEOUT: EventId = EventId::user(1);
/// # assert!(CONNECTED.is_user() && TIMEOUT.is_user());
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EventId(u16);

impl EventId {
    /// Reserved: delivered to a handler when its state is entered.
    pub const ENTRY: Self = Self(0);
    /// Reserved: delivered to a handler when its state is exited.
    pub const EXIT: Self = Self(1);

    const USER_BASE: u16 = 2;

    /// The `n`-th application event id.
    #[must_use]
    pub const fn user(n: u16) -> Self {
        assert!(n <= u16::MAX - Self::USER_BASE, "user event id out of range");
        Self(n + Self::USER_BASE)
    }

    /// Returns `false` for the reserved [`ENTRY`][Self::ENTRY] and
    /// [`EXIT`][Self::EXIT] ids.
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER_BASE
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ENTRY => f.write_str("ENTRY"),
            Self::EXIT => f.write_str("EXIT"),
            Self(n) => write!(f, "user({})", n - Self::USER_BASE),
        }
    }
}

/// Number of payload bytes an event can carry without touching the heap.
pub const INLINE_DATA: usize = size_of::<*const u8>();

/// Event payload storage.
///
/// Payloads up to pointer width are packed inline into the record so small
/// messages never touch the general heap; anything larger is copied into a
/// boxed slice, counted by [`HeapStats`].
pub(crate) enum Payload {
    Empty,
    Inline { len: u8, bytes: [u8; INLINE_DATA] },
    Heap(Box<[u8]>),
}

impl Payload {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Inline { len, bytes } => &bytes[..usize::from(*len)],
            Payload::Heap(data) => data,
        }
    }
}

/// Book-keeping for heap copies of oversize payloads.
///
/// The pair must balance whenever the scheduler is idle and again at
/// teardown; the number of outstanding copies can never exceed the
/// event-pool capacity because every copy hangs off an event record.
pub(crate) struct HeapStats {
    mallocs: u64,
    frees: u64,
    bound: u64,
}

impl HeapStats {
    pub(crate) fn new(bound: usize) -> Self {
        Self {
            mallocs: 0,
            frees: 0,
            bound: bound as u64,
        }
    }

    /// Builds the payload for `data`, copying to the heap when it exceeds
    /// the inline bound.
    pub(crate) fn alloc(&mut self, data: &[u8]) -> Payload {
        if data.is_empty() {
            Payload::Empty
        } else if data.len() <= INLINE_DATA {
            let mut bytes = [0; INLINE_DATA];
            bytes[..data.len()].copy_from_slice(data);
            Payload::Inline {
                len: data.len() as u8,
                bytes,
            }
        } else {
            self.mallocs += 1;
            assert!(self.frees <= self.mallocs);
            assert!(
                self.mallocs - self.frees <= self.bound,
                "more outstanding payload copies than event records"
            );
            Payload::Heap(data.into())
        }
    }

    /// Drops a payload, accounting for heap copies.
    pub(crate) fn free(&mut self, payload: Payload) {
        if let Payload::Heap(data) = payload {
            drop(data);
            self.frees += 1;
            assert!(self.frees <= self.mallocs);
        }
    }

    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.mallocs, self.frees)
    }

    pub(crate) fn balanced(&self) -> bool {
        self.mallocs == self.frees
    }
}

/// A queued message for one machine.
pub(crate) struct Event {
    links: Links<Event>,
    pub(crate) machine: MachineId,
    pub(crate) id: EventId,
    pub(crate) payload: Payload,
}

impl Event {
    pub(crate) fn new(machine: MachineId, id: EventId, payload: Payload) -> Self {
        Self {
            links: Links::new(),
            machine,
            id,
            payload,
        }
    }
}

// Safety: event records live in the scheduler's event pool, whose blocks
// stay pinned for the pool's lifetime; records only move between the free
// list, the event queue and the dispatcher.
unsafe impl Linked for Event {
    type Handle = NonNull<Event>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = core::mem::offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids() {
        assert!(!EventId::ENTRY.is_user());
        assert!(!EventId::EXIT.is_user());
        assert!(EventId::user(0).is_user());
        assert_ne!(EventId::user(0), EventId::user(1));
    }

    #[test]
    fn small_payloads_stay_inline() {
        let mut stats = HeapStats::new(4);

        let empty = stats.alloc(&[]);
        assert!(empty.as_slice().is_empty());

        let inline = stats.alloc(b"12345678");
        assert_eq!(inline.as_slice(), b"12345678");
        assert_eq!(stats.counters(), (0, 0));

        stats.free(empty);
        stats.free(inline);
        assert_eq!(stats.counters(), (0, 0));
    }

    #[test]
    fn oversize_payloads_are_counted() {
        let mut stats = HeapStats::new(4);
        let payload = stats.alloc(b"123456789");
        assert_eq!(payload.as_slice(), b"123456789");
        assert_eq!(stats.counters(), (1, 0));
        assert!(!stats.balanced());

        stats.free(payload);
        assert_eq!(stats.counters(), (1, 1));
        assert!(stats.balanced());
    }

    #[test]
    #[should_panic(expected = "more outstanding payload copies")]
    fn copy_bound_is_enforced() {
        let mut stats = HeapStats::new(1);
        let _a = stats.alloc(b"123456789");
        let _b = stats.alloc(b"123456789");
    }
}
