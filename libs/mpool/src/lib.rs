// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # A fixed-block memory pool with overrun canaries.
//!
//! A [`Pool<T>`] owns one allocation of `blocks` same-sized slots and hands
//! them out in O(1) via an internal free list. Acquire and release never
//! touch the general heap, so allocation behavior stays bounded no matter
//! how fragmented the rest of the system is; running out of blocks is a
//! *configuration* error and panics rather than degrading.
//!
//! Each slot carries a trailing canary `{0x12, 0x34, 0x56, owner}`. The
//! constant prefix is verified on every acquire and release, catching
//! out-of-bounds writes by the most recent user; the fourth byte records
//! the owner tag supplied to the most recent [`Pool::acquire`], which
//! localizes a smashed or leaked block to its last owner during post-mortem
//! debugging.
//!
//! The pool is typed: the block size is `size_of::<T>()`, so "requested
//! size exceeds the block size" is impossible to express rather than a
//! runtime error.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use core::fmt;
use core::mem::MaybeUninit;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use ilist::{Linked, Links, List};

const CANARY_PREFIX: [u8; 3] = [0x12, 0x34, 0x56];
/// Owner byte of a slot that has never been acquired.
const OWNER_UNUSED: u8 = 0xff;

/// One pool slot: free-list header, value region, trailing canary.
///
/// `repr(C)` pins the canary directly behind the value region so that an
/// overrun of the value clobbers the canary bytes first.
#[repr(C)]
struct Slot<T> {
    links: Links<Slot<T>>,
    value: MaybeUninit<T>,
    canary: [u8; 4],
}

// Safety: slots are pinned inside the pool's storage allocation for the
// pool's whole lifetime and are only ever moved between the free list and
// the caller, never in memory.
unsafe impl<T> Linked for Slot<T> {
    type Handle = NonNull<Slot<T>>;

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

/// A fixed-capacity allocator of `T`-sized blocks.
///
/// All blocks are carved out of a single storage allocation made at
/// construction time; [`Pool::acquire`] and [`Pool::release`] only move
/// slots on and off the internal free list.
pub struct Pool<T> {
    storage: NonNull<Slot<T>>,
    blocks: usize,
    avail: List<Slot<T>>,
}

impl<T> Pool<T> {
    /// Creates a pool of `blocks` slots, all initially free.
    ///
    /// # Panics
    ///
    /// Panics if `blocks` is zero or the total storage size overflows;
    /// aborts (via the global alloc error handler) if the backing memory
    /// cannot be allocated.
    #[must_use]
    pub fn new(blocks: usize) -> Self {
        assert!(blocks > 0, "pool must have at least one block");
        let layout = Self::layout(blocks);
        // Safety: `layout` has non-zero size, `Slot` always carries at
        // least the links and the canary.
        let raw = unsafe { alloc(layout) };
        let Some(storage) = NonNull::new(raw.cast::<Slot<T>>()) else {
            handle_alloc_error(layout)
        };

        let mut avail = List::new(blocks);
        for i in 0..blocks {
            // Safety: `i` is within the `blocks`-sized allocation.
            let slot = unsafe { storage.add(i) };
            // Safety: freshly allocated memory, valid for writes.
            unsafe {
                slot.write(Slot {
                    links: Links::new(),
                    value: MaybeUninit::uninit(),
                    canary: [
                        CANARY_PREFIX[0],
                        CANARY_PREFIX[1],
                        CANARY_PREFIX[2],
                        OWNER_UNUSED,
                    ],
                });
            }
            avail.push_front(slot);
        }

        Self {
            storage,
            blocks,
            avail,
        }
    }

    /// Takes a free block, moves `value` into it and returns a pointer to
    /// the value region.
    ///
    /// `owner` is stamped into the slot canary for post-mortem attribution
    /// and carries no semantics otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the pool is exhausted or the slot canary was corrupted
    /// while the block sat on the free list.
    pub fn acquire(&mut self, value: T, owner: u8) -> NonNull<T> {
        let Some(slot) = self.avail.pop_back() else {
            panic!("pool exhausted, all {} blocks outstanding", self.blocks)
        };
        // Safety: `slot` points into our storage and is off the free list,
        // so nothing else touches it. All accesses go through the slot
        // pointer so the returned block keeps provenance over the whole
        // slot (release reconstructs the slot address from it).
        unsafe {
            let canary = &raw mut (*slot.as_ptr()).canary;
            let bytes = canary.read();
            assert!(
                bytes[..3] == CANARY_PREFIX,
                "pool canary corrupted on acquire"
            );
            canary.write([bytes[0], bytes[1], bytes[2], owner]);

            let block = (&raw mut (*slot.as_ptr()).value).cast::<T>();
            block.write(value);
            NonNull::new_unchecked(block)
        }
    }

    /// Verifies the canary, moves the value out and returns the block to
    /// the free list.
    ///
    /// # Panics
    ///
    /// Panics if the canary prefix was overwritten while the block was
    /// outstanding.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`Pool::acquire`] on this pool
    /// and not yet released.
    pub unsafe fn release(&mut self, block: NonNull<T>) -> T {
        let offset = core::mem::offset_of!(Slot<T>, value);
        let slot = block
            .cast::<u8>()
            .map_addr(|addr| {
                NonZeroUsize::new(addr.get() - offset).expect("bogus block pointer")
            })
            .cast::<Slot<T>>();

        // Safety: per the caller contract `slot` is an outstanding slot of
        // this pool, nothing else references it, and its value region is
        // initialized.
        let value = unsafe {
            let bytes = (&raw const (*slot.as_ptr()).canary).read();
            assert!(
                bytes[..3] == CANARY_PREFIX,
                "pool canary corrupted on release, last owner {:#04x}",
                bytes[3]
            );
            block.read()
        };
        self.avail.push_front(slot);
        value
    }

    /// Size in bytes of one block's value region.
    pub const fn block_size(&self) -> usize {
        size_of::<T>()
    }

    /// Total number of blocks.
    pub fn capacity(&self) -> usize {
        self.blocks
    }

    /// Number of blocks currently free.
    pub fn free_count(&self) -> usize {
        self.avail.len()
    }

    /// Returns `true` when no free blocks remain.
    pub fn is_empty(&self) -> bool {
        self.avail.is_empty()
    }

    /// Returns `true` when every block has been returned.
    pub fn is_full(&self) -> bool {
        self.avail.is_full()
    }

    /// Owner bytes of every slot, in storage order.
    ///
    /// Slots that were never acquired report `0xff`; all others report the
    /// tag passed to their most recent [`Pool::acquire`], which is how a
    /// leaked block is traced back to its owner.
    #[cfg(feature = "debug")]
    pub fn owners(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.blocks).map(|i| {
            // Safety: `i` is within the storage allocation; this is a plain
            // byte read through the original storage pointer.
            unsafe { (*self.storage.add(i).as_ptr()).canary[3] }
        })
    }

    fn layout(blocks: usize) -> Layout {
        Layout::array::<Slot<T>>(blocks).expect("pool storage size overflows")
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // Outstanding blocks keep the storage alive; reclaiming it under
        // them would dangle every pointer handed out by `acquire`. A pool
        // dropped while not full therefore leaks its storage - callers are
        // expected to return every block first.
        if !self.avail.is_full() {
            return;
        }
        while self.avail.pop_front().is_some() {}
        // Safety: allocated in `new` with the identical layout; the free
        // list is drained so nothing points into the storage anymore.
        unsafe { dealloc(self.storage.as_ptr().cast::<u8>(), Self::layout(self.blocks)) }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.block_size())
            .field("capacity", &self.blocks)
            .field("free", &self.free_count())
            .finish()
    }
}

// Safety: the pool exclusively owns its storage; sending it transfers that
// ownership wholesale.
unsafe impl<T: Send> Send for Pool<T> {}
// Safety: `&Pool` only exposes the read-only queries.
unsafe impl<T: Sync> Sync for Pool<T> {}
