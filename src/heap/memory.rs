//! Linear Memory
//!
//! The flat byte buffer native code computes in, carved into a static
//! region, a scratch stack and a growable dynamic region. The brk word
//! lives inside the buffer itself, at an address reserved during layout.

use crate::heap::alloc::FreeList;

/// Default start of the static region.
pub const GLOBAL_BASE: u32 = 1024;
/// Default scratch stack size.
pub const TOTAL_STACK: u32 = 5_242_880;
/// Default (and minimum) committed buffer size.
pub const TOTAL_MEMORY: u32 = 16_777_216;
/// Growth granularity.
pub const WASM_PAGE_SIZE: u32 = 65_536;
/// Alignment handed to mapped regions.
pub const MMAP_PAGE_SIZE: u32 = 16_384;

/// The committed size never exceeds this.
const GROWTH_LIMIT: u64 = 2_147_483_648 - WASM_PAGE_SIZE as u64;

#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub static_base: u32,
    /// Bytes reserved up front for a native module's data segment.
    pub static_size: u32,
    pub total_stack: u32,
    pub total_memory: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            static_base: GLOBAL_BASE,
            static_size: 0,
            total_stack: TOTAL_STACK,
            total_memory: TOTAL_MEMORY,
        }
    }
}

/// Which region `allocate` carves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    /// malloc-backed, released with `free`.
    Normal,
    /// Scratch stack, released with `stack_restore`.
    Stack,
    /// Static region; only legal while layout is still open.
    Static,
    /// Raw brk bump, never released.
    Dynamic,
    /// No allocation, the bytes land at the given address.
    None { at: u32 },
}

pub struct LinearMemory {
    buffer: Vec<u8>,
    statictop: u32,
    static_sealed: bool,
    stack_base: u32,
    stacktop: u32,
    stack_max: u32,
    dynamic_base: u32,
    dynamictop_ptr: u32,
    allocator: FreeList,
}

impl LinearMemory {
    pub fn new(config: HeapConfig) -> Self {
        if config.total_memory < config.total_stack {
            log::error!(
                "total_memory should be larger than total_stack, was {}! (total_stack = {})",
                config.total_memory,
                config.total_stack
            );
        }
        let mut memory = LinearMemory {
            buffer: vec![0; config.total_memory as usize],
            statictop: config.static_base,
            static_sealed: false,
            stack_base: 0,
            stacktop: 0,
            stack_max: 0,
            dynamic_base: 0,
            dynamictop_ptr: 0,
            allocator: FreeList::new(),
        };
        if config.static_size > 0 {
            memory.static_alloc(config.static_size);
        }
        memory.dynamictop_ptr = memory.static_alloc(4);
        memory.stack_base = align16(memory.statictop);
        memory.stacktop = memory.stack_base;
        memory.stack_max = memory.stack_base + config.total_stack;
        memory.dynamic_base = align16(memory.stack_max);
        memory.write_u32(memory.dynamictop_ptr, memory.dynamic_base);
        memory.static_sealed = true;
        memory
    }

    /// Committed buffer size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stack_base(&self) -> u32 {
        self.stack_base
    }

    pub fn dynamic_base(&self) -> u32 {
        self.dynamic_base
    }

    /// Current brk, read out of the buffer.
    pub fn dynamic_top(&self) -> u32 {
        self.read_u32(self.dynamictop_ptr)
    }

    // ------------------------------------------------------------------
    // allocators

    fn static_alloc(&mut self, size: u32) -> u32 {
        if self.static_sealed {
            panic!("static allocation of {} bytes after the region was sealed", size);
        }
        let ret = self.statictop;
        self.statictop = align16(self.statictop + size);
        ret
    }

    /// Bump the scratch stack. Callers bracket with `stack_save` and
    /// `stack_restore`; exhausting the stack region is fatal.
    pub fn stack_alloc(&mut self, size: u32) -> u32 {
        let ret = self.stacktop;
        let top = (ret as u64 + size as u64 + 15) & !15;
        if top >= self.stack_max as u64 {
            panic!(
                "stack overflow: {} byte allocation pushed the scratch stack to {:#x} (limit {:#x})",
                size, top, self.stack_max
            );
        }
        self.stacktop = top as u32;
        ret
    }

    pub fn stack_save(&self) -> u32 {
        self.stacktop
    }

    pub fn stack_restore(&mut self, top: u32) {
        self.stacktop = top;
    }

    /// Bump the brk, growing the committed buffer when the new top runs
    /// past it. Returns 0 and leaves the brk untouched when growth fails.
    pub fn dynamic_alloc(&mut self, size: u32) -> u32 {
        let ret = self.read_u32(self.dynamictop_ptr);
        let end = (ret as u64 + size as u64 + 15) & !15;
        if end > u32::MAX as u64 {
            return 0;
        }
        self.write_u32(self.dynamictop_ptr, end as u32);
        if end >= self.buffer.len() as u64 && !self.grow_buffer() {
            self.write_u32(self.dynamictop_ptr, ret);
            return 0;
        }
        ret
    }

    /// Grow the committed buffer to cover the current brk: doubling while
    /// small, then 1.25x steps, page-aligned, capped just under 2 GiB.
    /// Always a fresh buffer plus a full copy, never in place.
    fn grow_buffer(&mut self) -> bool {
        let target = self.read_u32(self.dynamictop_ptr) as u64;
        if target > GROWTH_LIMIT {
            return false;
        }
        let mut total = (self.buffer.len() as u64).max(TOTAL_MEMORY as u64);
        while total < target {
            if total <= 536_870_912 {
                total = align_up(total * 2, WASM_PAGE_SIZE as u64);
            } else {
                total = align_up(total + total / 4, WASM_PAGE_SIZE as u64).min(GROWTH_LIMIT);
            }
        }
        let mut grown: Vec<u8> = Vec::new();
        if grown.try_reserve_exact(total as usize).is_err() {
            return false;
        }
        grown.resize(total as usize, 0);
        grown[..self.buffer.len()].copy_from_slice(&self.buffer);
        log::debug!("grew heap from {} to {} bytes", self.buffer.len(), total);
        self.buffer = grown;
        true
    }

    /// Allocate from the dynamic region, reusing freed blocks first.
    /// Returns 0 on failure or for a zero-size request.
    pub fn malloc(&mut self, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let size = match size.checked_add(15) {
            Some(size) => size & !15,
            None => return 0,
        };
        if let Some(ptr) = self.allocator.take(size) {
            return ptr;
        }
        let ptr = self.dynamic_alloc(size);
        if ptr == 0 {
            return 0;
        }
        self.allocator.record(ptr, size);
        ptr
    }

    pub fn free(&mut self, ptr: u32) {
        if ptr == 0 {
            return;
        }
        if self.allocator.release(ptr).is_none() {
            log::warn!("free of unknown pointer {:#x}", ptr);
        }
    }

    /// `malloc` with a power-of-two alignment. Padding carved off either
    /// side of the block goes back on the free list.
    pub fn memalign(&mut self, alignment: u32, size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let alignment = alignment.max(16);
        assert!(
            alignment.is_power_of_two(),
            "memalign alignment {} is not a power of two",
            alignment
        );
        let size = match size.checked_add(15) {
            Some(size) => size & !15,
            None => return 0,
        };
        if let Some(ptr) = self.allocator.take_aligned(alignment, size) {
            return ptr;
        }
        let span = match size.checked_add(alignment) {
            Some(span) => span,
            None => return 0,
        };
        let ptr = self.dynamic_alloc(span);
        if ptr == 0 {
            return 0;
        }
        let aligned = (ptr + alignment - 1) & !(alignment - 1);
        if aligned > ptr {
            self.allocator.add_free_region(ptr, aligned - ptr);
        }
        let tail = aligned + size;
        if tail < ptr + span {
            self.allocator.add_free_region(tail, ptr + span - tail);
        }
        self.allocator.record(aligned, size);
        aligned
    }

    /// Copy `bytes` into the region the policy names and return their
    /// address. Zero-length input still claims a minimal block. Returns 0
    /// when the backing allocator fails.
    pub fn allocate(&mut self, bytes: &[u8], policy: AllocPolicy) -> u32 {
        let size = (bytes.len() as u32).max(1);
        let ptr = match policy {
            AllocPolicy::Normal => self.malloc(size),
            AllocPolicy::Stack => self.stack_alloc(size),
            AllocPolicy::Static => self.static_alloc(size),
            AllocPolicy::Dynamic => self.dynamic_alloc(size),
            AllocPolicy::None { at } => at,
        };
        if ptr != 0 {
            self.write_bytes(ptr, bytes);
        }
        ptr
    }

    // ------------------------------------------------------------------
    // typed access, little-endian throughout

    pub fn read_u8(&self, ptr: u32) -> u8 {
        self.buffer[ptr as usize]
    }

    pub fn write_u8(&mut self, ptr: u32, value: u8) {
        self.buffer[ptr as usize] = value;
    }

    pub fn read_u16(&self, ptr: u32) -> u16 {
        let p = ptr as usize;
        u16::from_le_bytes([self.buffer[p], self.buffer[p + 1]])
    }

    pub fn write_u16(&mut self, ptr: u32, value: u16) {
        let p = ptr as usize;
        self.buffer[p..p + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u32(&self, ptr: u32) -> u32 {
        let p = ptr as usize;
        u32::from_le_bytes([
            self.buffer[p],
            self.buffer[p + 1],
            self.buffer[p + 2],
            self.buffer[p + 3],
        ])
    }

    pub fn write_u32(&mut self, ptr: u32, value: u32) {
        let p = ptr as usize;
        self.buffer[p..p + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, ptr: u32) -> i32 {
        self.read_u32(ptr) as i32
    }

    pub fn write_i32(&mut self, ptr: u32, value: i32) {
        self.write_u32(ptr, value as u32);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn slice(&self, ptr: u32, len: usize) -> &[u8] {
        let p = ptr as usize;
        &self.buffer[p..p + len]
    }

    pub fn slice_mut(&mut self, ptr: u32, len: usize) -> &mut [u8] {
        let p = ptr as usize;
        &mut self.buffer[p..p + len]
    }

    pub fn write_bytes(&mut self, ptr: u32, src: &[u8]) {
        let p = ptr as usize;
        self.buffer[p..p + src.len()].copy_from_slice(src);
    }

    pub fn memset(&mut self, ptr: u32, value: u8, len: usize) {
        let p = ptr as usize;
        self.buffer[p..p + len].fill(value);
    }

    /// Decode the NUL-terminated string at `ptr`, lossily for invalid
    /// UTF-8. An unterminated string runs to the end of the buffer.
    pub fn read_cstr(&self, ptr: u32) -> String {
        let p = ptr as usize;
        let end = self.buffer[p..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| p + i)
            .unwrap_or(self.buffer.len());
        String::from_utf8_lossy(&self.buffer[p..end]).into_owned()
    }

    /// Encode `s` at `ptr` within `max_bytes`, never splitting a UTF-8
    /// scalar and always NUL-terminating when there is room for anything.
    /// Returns the bytes written, the terminator excluded.
    pub fn write_cstr(&mut self, s: &str, ptr: u32, max_bytes: u32) -> usize {
        if max_bytes == 0 {
            return 0;
        }
        let limit = (max_bytes - 1) as usize;
        let mut written = 0;
        for ch in s.chars() {
            let mut encoded = [0u8; 4];
            let encoded = ch.encode_utf8(&mut encoded).as_bytes();
            if written + encoded.len() > limit {
                break;
            }
            let p = ptr as usize + written;
            self.buffer[p..p + encoded.len()].copy_from_slice(encoded);
            written += encoded.len();
        }
        self.buffer[ptr as usize + written] = 0;
        written
    }

    /// Write `s` one byte per character, NUL-terminated. Characters past
    /// ASCII keep their low byte only.
    pub fn write_ascii(&mut self, s: &str, ptr: u32) {
        let mut p = ptr as usize;
        for ch in s.chars() {
            self.buffer[p] = ch as u8;
            p += 1;
        }
        self.buffer[p] = 0;
    }
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

fn align16(x: u32) -> u32 {
    (x + 15) & !15
}

/// Round `x` up to the next multiple.
pub fn align_up(x: u64, multiple: u64) -> u64 {
    (x + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let m = LinearMemory::default();
        assert_eq!(m.len(), TOTAL_MEMORY as usize);
        assert_eq!(m.stack_base() % 16, 0);
        assert_eq!(m.dynamic_base() % 16, 0);
        assert!(m.dynamic_base() >= m.stack_base() + TOTAL_STACK);
        assert_eq!(m.dynamic_top(), m.dynamic_base());
    }

    #[test]
    fn test_static_region_reservation() {
        let m = LinearMemory::new(HeapConfig {
            static_size: 1000,
            ..Default::default()
        });
        assert!(m.stack_base() >= GLOBAL_BASE + 1000);
    }

    #[test]
    fn test_little_endian_access() {
        let mut m = LinearMemory::default();
        let p = m.dynamic_base();
        m.write_u32(p, 0x1122_3344);
        assert_eq!(m.read_u8(p), 0x44);
        assert_eq!(m.read_u8(p + 3), 0x11);
        assert_eq!(m.read_u16(p), 0x3344);
        assert_eq!(m.read_u32(p), 0x1122_3344);
        m.write_i32(p, -2);
        assert_eq!(m.read_i32(p), -2);
        assert_eq!(m.read_u32(p), 0xFFFF_FFFE);
    }

    #[test]
    fn test_stack_alloc_is_lifo() {
        let mut m = LinearMemory::default();
        let saved = m.stack_save();
        let a = m.stack_alloc(33);
        let b = m.stack_alloc(1);
        assert_eq!(a % 16, 0);
        assert_eq!(b, a + 48);
        m.stack_restore(saved);
        assert_eq!(m.stack_alloc(8), a);
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn test_stack_overflow_aborts() {
        let mut m = LinearMemory::default();
        m.stack_alloc(TOTAL_STACK);
    }

    #[test]
    fn test_dynamic_alloc_bumps_brk() {
        let mut m = LinearMemory::default();
        let a = m.dynamic_alloc(33);
        let b = m.dynamic_alloc(1);
        assert_eq!(a, m.dynamic_base());
        assert_eq!(b, a + 48);
        assert_eq!(m.dynamic_top(), b + 16);
    }

    #[test]
    fn test_growth_preserves_contents() {
        let mut m = LinearMemory::default();
        let marker = m.dynamic_alloc(4);
        m.write_u32(marker, 0xDEAD_BEEF);
        let old_len = m.len();
        let big = m.malloc(20_000_000);
        assert_ne!(big, 0);
        assert!(m.len() > old_len);
        assert_eq!(m.len() % WASM_PAGE_SIZE as usize, 0);
        assert_eq!(m.read_u32(marker), 0xDEAD_BEEF);
        m.write_u8(big + 19_999_999, 7);
        assert_eq!(m.read_u8(big + 19_999_999), 7);
    }

    #[test]
    fn test_growth_failure_rolls_back() {
        let mut m = LinearMemory::default();
        let brk = m.dynamic_top();
        assert_eq!(m.dynamic_alloc(0x7FFF_0000), 0);
        assert_eq!(m.dynamic_top(), brk);
        assert_eq!(m.malloc(0x7FFF_0000), 0);
    }

    #[test]
    fn test_malloc_reuses_freed_blocks() {
        let mut m = LinearMemory::default();
        assert_eq!(m.malloc(0), 0);
        let a = m.malloc(64);
        let after = m.malloc(16);
        m.free(a);
        let b = m.malloc(32);
        let c = m.malloc(16);
        assert_eq!(b, a);
        assert_eq!(c, a + 32);
        m.free(b);
        m.free(c);
        assert_eq!(m.malloc(64), a);
        assert_ne!(after, a);
        m.free(0);
    }

    #[test]
    fn test_memalign() {
        let mut m = LinearMemory::default();
        m.malloc(24);
        let p = m.memalign(MMAP_PAGE_SIZE, 100);
        assert_ne!(p, 0);
        assert_eq!(p % MMAP_PAGE_SIZE, 0);
        m.write_bytes(p, b"mapped");
        assert_eq!(m.slice(p, 6), b"mapped");
        // padding in front of the aligned block is allocatable
        let small = m.malloc(16);
        assert!(small < p);
    }

    #[test]
    fn test_allocate_policies() {
        let mut m = LinearMemory::default();
        let normal = m.allocate(b"norm", AllocPolicy::Normal);
        assert_eq!(m.slice(normal, 4), b"norm");
        m.free(normal);
        let stack = m.allocate(b"stk", AllocPolicy::Stack);
        assert_eq!(m.slice(stack, 3), b"stk");
        let dynamic = m.allocate(b"dyn", AllocPolicy::Dynamic);
        assert_eq!(m.slice(dynamic, 3), b"dyn");
        let spot = m.malloc(8);
        let placed = m.allocate(b"here", AllocPolicy::None { at: spot });
        assert_eq!(placed, spot);
        assert_eq!(m.slice(spot, 4), b"here");
    }

    #[test]
    #[should_panic(expected = "sealed")]
    fn test_allocate_static_after_layout_aborts() {
        let mut m = LinearMemory::default();
        m.allocate(b"late", AllocPolicy::Static);
    }

    #[test]
    fn test_write_ascii() {
        let mut m = LinearMemory::default();
        let p = m.dynamic_alloc(16);
        m.write_ascii("PATH=/", p);
        assert_eq!(m.slice(p, 6), b"PATH=/");
        assert_eq!(m.read_u8(p + 6), 0);
        assert_eq!(m.read_cstr(p), "PATH=/");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(65_536, 65_536), 65_536);
        assert_eq!(align_up(65_537, 65_536), 131_072);
    }

    #[test]
    fn test_cstr_round_trip() {
        let mut m = LinearMemory::default();
        let p = m.dynamic_alloc(64);
        let n = m.write_cstr("héllo", p, 64);
        assert_eq!(n, 6);
        assert_eq!(m.read_u8(p + 6), 0);
        assert_eq!(m.read_cstr(p), "héllo");
    }

    #[test]
    fn test_cstr_truncation_respects_scalars() {
        let mut m = LinearMemory::default();
        let p = m.dynamic_alloc(16);
        m.memset(p, 0xAA, 8);
        // "é" needs two bytes; five fit but the sixth would split it
        let n = m.write_cstr("aaaaé", p, 6);
        assert_eq!(n, 4);
        assert_eq!(m.read_cstr(p), "aaaa");
        assert_eq!(m.read_u8(p + 5), 0xAA);
        assert_eq!(m.write_cstr("x", p, 0), 0);
    }

    #[test]
    fn test_memset_and_slices() {
        let mut m = LinearMemory::default();
        let p = m.dynamic_alloc(32);
        m.memset(p, 9, 8);
        assert_eq!(m.slice(p, 8), &[9u8; 8]);
        m.slice_mut(p, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(m.read_u8(p + 2), 3);
        assert_eq!(m.bytes().len(), m.len());
    }
}
