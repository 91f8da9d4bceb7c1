//! A mostly-copying garbage collected heap for unmanaged host programs.
//!
//! Objects are allocated with a declared byte size and a declared count of
//! leading pointer words. Unreachable storage is reclaimed by copying live
//! objects into a fresh space: registered global cells are relocated
//! exactly, while words found on the host stack serve as conservative
//! hints that pin their pages in place instead of moving them.
//!
//! Key types:
//! - [`Heap`]: the paged heap, bump allocator, and collector
//! - [`HintSource`]: supplies ambiguous root words; [`MachineStack`] scans
//!   the machine stack
//! - [`Header`] / [`HeaderWord`]: the one-word object header, doubling as
//!   a forwarding slot once an object has moved

mod header;
mod heap;
mod system;

pub use header::{Gcp, Header, HeaderWord, WORD_BYTES};
pub use heap::{
    Heap, HeapSettings, HintSource, MachineStack, PAGE_BYTES, PAGE_WORDS,
    PageKind,
};
pub use system::{
    OS_PAGE_SIZE, map_memory, stack_pointer, unmap_memory, with_stack_base,
};
