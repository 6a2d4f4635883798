//! Syscall Argument Decoding
//!
//! Syscalls arrive as a number plus a pointer to an argument block in the
//! linear memory. The cursor walks that block one 32-bit word at a time;
//! wide arguments are split low/high across two words.

use crate::heap::LinearMemory;

/// Cursor over a syscall argument block.
#[derive(Debug)]
pub struct VarArgs {
    cursor: u32,
}

impl VarArgs {
    pub fn new(ptr: u32) -> Self {
        VarArgs { cursor: ptr }
    }

    /// Next argument word.
    pub fn get(&mut self, heap: &LinearMemory) -> i32 {
        let value = heap.read_i32(self.cursor);
        self.cursor += 4;
        value
    }

    /// Next word, followed as a pointer to a NUL-terminated string.
    pub fn get_str(&mut self, heap: &LinearMemory) -> String {
        let ptr = self.get(heap) as u32;
        heap.read_cstr(ptr)
    }

    /// Next 64-bit argument. The high word must be the sign extension of
    /// the low word; values outside the 32-bit range are a bridge defect.
    pub fn get64(&mut self, heap: &LinearMemory) -> i64 {
        let low = self.get(heap);
        let high = self.get(heap);
        if low >= 0 {
            assert_eq!(high, 0);
        } else {
            assert_eq!(high, -1);
        }
        low as i64
    }

    /// Next word the calling convention promises is zero.
    pub fn get_zero(&mut self, heap: &LinearMemory) {
        let zero = self.get(heap);
        assert_eq!(zero, 0);
    }
}
