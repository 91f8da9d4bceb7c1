//! Minimal host program for the collected heap.
//!
//! Builds a linked list that stays reachable only through a stack local,
//! churns garbage through several collections, and walks the list at the
//! end to show that conservative pinning plus exact sweeping kept it
//! intact.
//!
//!   cargo run --bin demo

use mostly::{Gcp, Heap, HeapSettings, MachineStack, WORD_BYTES, with_stack_base};

const LIVE_NODES: usize = 32;
const GARBAGE_OBJECTS: usize = 4096;

fn main() {
    with_stack_base(run);
}

fn run(stack_base: *const u8) {
    let mut heap = Heap::new(
        HeapSettings {
            heap_size: 64 * 1024,
        },
        Box::new(MachineStack::new(stack_base)),
    );

    // Node layout: next pointer, then a payload word.
    let mut head: Gcp = std::ptr::null_mut();
    for index in 0..LIVE_NODES {
        let node = heap.allocate(2 * WORD_BYTES, 1);
        unsafe {
            *node = head as usize;
            *node.add(1) = index;
        }
        head = node;
        std::hint::black_box(&head);
    }

    for _ in 0..GARBAGE_OBJECTS {
        heap.allocate(48, 0);
        std::hint::black_box(&head);
    }

    let mut sum = 0usize;
    let mut node = head;
    while !node.is_null() {
        sum += unsafe { *node.add(1) };
        node = unsafe { *node } as Gcp;
    }

    println!(
        "kept {LIVE_NODES} nodes (payload sum {sum}) across {} collections; \
         {} of {} pages live",
        heap.collections(),
        heap.allocated_pages(),
        heap.page_count(),
    );
    assert_eq!(sum, LIVE_NODES * (LIVE_NODES - 1) / 2);
}
