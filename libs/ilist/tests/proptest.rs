// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::ptr::NonNull;

use ilist::{Linked, Links, List};
use proptest::prelude::*;

#[derive(Default)]
struct Node {
    links: Links<Self>,
    value: u64,
}

unsafe impl Linked for Node {
    type Handle = Box<Self>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: nodes are only ever inserted as leaked boxes.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = core::mem::offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    PushFront(u64),
    PushBack(u64),
    PopFront,
    PopBack,
}

fn ops(len: usize) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            any::<u64>().prop_map(Op::PushFront),
            any::<u64>().prop_map(Op::PushBack),
            Just(Op::PopFront),
            Just(Op::PopBack),
        ],
        0..len,
    )
}

proptest! {
    /// The list behaves exactly like a deque with the same bounded
    /// capacity, and `len + unused == capacity` holds after every step.
    #[test]
    fn behaves_like_a_bounded_deque(ops in ops(256)) {
        const CAPACITY: usize = 16;

        let mut list = List::<Node>::new(CAPACITY);
        let mut model: VecDeque<u64> = VecDeque::new();

        for op in ops {
            match op {
                Op::PushFront(value) => {
                    if model.len() < CAPACITY {
                        model.push_front(value);
                        list.push_front(Box::new(Node { value, ..Node::default() }));
                    }
                }
                Op::PushBack(value) => {
                    if model.len() < CAPACITY {
                        model.push_back(value);
                        list.push_back(Box::new(Node { value, ..Node::default() }));
                    }
                }
                Op::PopFront => {
                    prop_assert_eq!(model.pop_front(), list.pop_front().map(|node| node.value));
                }
                Op::PopBack => {
                    prop_assert_eq!(model.pop_back(), list.pop_back().map(|node| node.value));
                }
            }

            prop_assert_eq!(list.len(), model.len());
            prop_assert_eq!(list.len() + list.unused(), list.capacity());
            prop_assert!(list.len() <= list.capacity());
        }

        while list.pop_front().is_some() {}
    }

    /// FIFO law: popping from the back returns elements in push-front
    /// order.
    #[test]
    fn fifo_law(values in proptest::collection::vec(any::<u64>(), 0..16)) {
        let mut list = List::<Node>::new(16);
        for &value in &values {
            list.push_front(Box::new(Node { value, ..Node::default() }));
        }
        for &expected in &values {
            prop_assert_eq!(list.pop_back().unwrap().value, expected);
        }
        prop_assert!(list.pop_back().is_none());
    }
}
