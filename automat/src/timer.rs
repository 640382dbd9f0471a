// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;

use ilist::{Linked, Links};

use crate::clock::Ticks;
use crate::event::Event;

/// An armed timer: the deferred event it owns plus the absolute deadline
/// gating its delivery.
///
/// The event record lives in the scheduler's event pool; when the deadline
/// passes, the record migrates onto the event queue and this shell is
/// freed.
pub(crate) struct Timer {
    links: Links<Timer>,
    pub(crate) event: NonNull<Event>,
    pub(crate) deadline: Ticks,
}

impl Timer {
    pub(crate) fn new(event: NonNull<Event>, deadline: Ticks) -> Self {
        Self {
            links: Links::new(),
            event,
            deadline,
        }
    }
}

// Safety: timer records live in the scheduler's timer pool, whose blocks
// stay pinned for the pool's lifetime; shells only move between the free
// list and the timer list.
unsafe impl Linked for Timer {
    type Handle = NonNull<Timer>;

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

// Safety: the inner event pointer targets an event-pool block that is only
// dereferenced by whoever holds the scheduler core lock.
unsafe impl Send for Timer {}
