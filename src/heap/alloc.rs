//! Free-List Allocator
//!
//! Book-keeping for malloc and friends over the dynamic region: freed
//! blocks keyed by offset, first-fit reuse with splitting, and immediate
//! coalescing of adjacent blocks. Offsets and sizes stay 16-aligned.

use std::collections::{BTreeMap, HashMap};

pub struct FreeList {
    free: BTreeMap<u32, u32>,
    allocated: HashMap<u32, u32>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            free: BTreeMap::new(),
            allocated: HashMap::new(),
        }
    }

    /// First free block that fits, lowest offset wins. The remainder of a
    /// larger block stays free.
    pub fn take(&mut self, size: u32) -> Option<u32> {
        let (&offset, &block) = self.free.iter().find(|(_, &block)| block >= size)?;
        self.free.remove(&offset);
        if block > size {
            self.free.insert(offset + size, block - size);
        }
        self.allocated.insert(offset, size);
        Some(offset)
    }

    /// First free block that can hold `size` bytes at the given alignment.
    /// Padding before and after the carved block stays free.
    pub fn take_aligned(&mut self, alignment: u32, size: u32) -> Option<u32> {
        let mut found = None;
        for (&offset, &block) in self.free.iter() {
            let aligned = (offset + alignment - 1) & !(alignment - 1);
            let head = aligned - offset;
            if head as u64 + size as u64 <= block as u64 {
                found = Some((offset, block, aligned));
                break;
            }
        }
        let (offset, block, aligned) = found?;
        self.free.remove(&offset);
        let head = aligned - offset;
        if head > 0 {
            self.free.insert(offset, head);
        }
        let tail = block - head - size;
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }
        self.allocated.insert(aligned, size);
        Some(aligned)
    }

    /// Track a block carved from fresh brk space.
    pub fn record(&mut self, offset: u32, size: u32) {
        self.allocated.insert(offset, size);
    }

    /// Return a tracked block to the free list. None for a pointer this
    /// allocator never handed out.
    pub fn release(&mut self, offset: u32) -> Option<u32> {
        let size = self.allocated.remove(&offset)?;
        self.add_free_region(offset, size);
        Some(size)
    }

    /// Donate a region that was never handed out, such as alignment
    /// padding. Merges with free neighbors on both sides.
    pub fn add_free_region(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        let mut offset = offset;
        let mut size = size;
        if let Some((&prev_offset, &prev_size)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        if let Some(&next_size) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            size += next_size;
        }
        self.free.insert(offset, size);
    }

    pub fn size_of(&self, offset: u32) -> Option<u32> {
        self.allocated.get(&offset).copied()
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_splits_blocks() {
        let mut list = FreeList::new();
        assert_eq!(list.take(16), None);
        list.add_free_region(1024, 128);
        assert_eq!(list.take(48), Some(1024));
        assert_eq!(list.size_of(1024), Some(48));
        assert_eq!(list.take(80), Some(1072));
        assert_eq!(list.take(16), None);
    }

    #[test]
    fn test_first_fit_prefers_lowest_offset() {
        let mut list = FreeList::new();
        list.add_free_region(4096, 64);
        list.add_free_region(1024, 64);
        assert_eq!(list.take(32), Some(1024));
        assert_eq!(list.take(64), Some(4096));
    }

    #[test]
    fn test_release_coalesces_neighbors() {
        let mut list = FreeList::new();
        list.add_free_region(1024, 96);
        let a = list.take(32).unwrap();
        let b = list.take(32).unwrap();
        let c = list.take(32).unwrap();
        assert_eq!((a, b, c), (1024, 1056, 1088));
        assert_eq!(list.release(a), Some(32));
        assert_eq!(list.release(c), Some(32));
        // the middle release bridges both sides into one block
        assert_eq!(list.release(b), Some(32));
        assert_eq!(list.take(96), Some(1024));
    }

    #[test]
    fn test_release_unknown_pointer() {
        let mut list = FreeList::new();
        assert_eq!(list.release(1024), None);
    }

    #[test]
    fn test_take_aligned_carves_padding() {
        let mut list = FreeList::new();
        list.add_free_region(1040, 1024 * 20);
        let p = list.take_aligned(4096, 256).unwrap();
        assert_eq!(p % 4096, 0);
        // head padding is reusable
        assert_eq!(list.take(16), Some(1040));
        // tail after the aligned block is reusable too
        assert_eq!(list.take(4000), Some(p + 256));
    }

    #[test]
    fn test_take_aligned_skips_small_blocks() {
        let mut list = FreeList::new();
        list.add_free_region(4000, 200);
        assert_eq!(list.take_aligned(4096, 200), None);
        list.add_free_region(8192, 256);
        assert_eq!(list.take_aligned(4096, 200), Some(8192));
    }
}
