//! Heap Module
//!
//! Linear memory for native code: region layout, the brk with buffer
//! growth, and the malloc-style allocator layered on top.

pub mod alloc;
pub mod memory;

pub use alloc::FreeList;
pub use memory::{
    align_up, AllocPolicy, HeapConfig, LinearMemory, GLOBAL_BASE, MMAP_PAGE_SIZE, TOTAL_MEMORY,
    TOTAL_STACK, WASM_PAGE_SIZE,
};
