//! Syscall Table
//!
//! Dispatch from syscall numbers to handlers. A handler returns either a
//! non-negative result or a direct negated errno through `Ok`, or a
//! filesystem error through `Err`; the dispatcher turns the latter into a
//! negated errno and records it in the caller's errno cell.

use std::collections::HashMap;

use crate::errors::VfsError;
use crate::fs::Vfs;
use crate::heap::LinearMemory;
use crate::syscall::args::VarArgs;
use crate::syscall::handlers;

/// A live memory mapping, keyed by the address handed to the caller.
#[derive(Debug, Clone)]
pub struct MmapRecord {
    pub malloc: u32,
    pub len: u32,
    /// Whether the region was allocated for the mapping and is freed on
    /// munmap.
    pub allocated: bool,
    /// Backing descriptor, -1 for anonymous mappings.
    pub fd: i32,
    pub flags: u32,
}

/// Everything one syscall runs against.
pub struct SyscallContext<'a> {
    pub vfs: &'a mut Vfs,
    pub heap: &'a mut LinearMemory,
    pub mappings: &'a mut HashMap<u32, MmapRecord>,
    pub errno_location: Option<u32>,
    pub args: VarArgs,
}

impl SyscallContext<'_> {
    /// Record an errno value where the caller's C library reads it. A
    /// missing errno cell drops the write.
    pub fn set_errno(&mut self, value: i32) {
        if let Some(location) = self.errno_location {
            self.heap.write_i32(location, value);
        }
    }
}

pub type SyscallHandler = for<'a, 'b> fn(&'a mut SyscallContext<'b>) -> Result<i32, VfsError>;

pub struct SyscallTable {
    handlers: HashMap<u32, SyscallHandler>,
}

impl SyscallTable {
    pub fn new() -> Self {
        let mut map: HashMap<u32, SyscallHandler> = HashMap::new();
        map.insert(3, handlers::sys_read);
        map.insert(4, handlers::sys_write);
        map.insert(5, handlers::sys_open);
        map.insert(6, handlers::sys_close);
        map.insert(10, handlers::sys_unlink);
        map.insert(15, handlers::sys_chmod);
        map.insert(20, handlers::sys_getpid);
        map.insert(33, handlers::sys_access);
        map.insert(38, handlers::sys_rename);
        map.insert(54, handlers::sys_ioctl);
        map.insert(77, handlers::sys_getrusage);
        map.insert(83, handlers::sys_symlink);
        map.insert(85, handlers::sys_readlink);
        map.insert(91, handlers::sys_munmap);
        map.insert(94, handlers::sys_fchmod);
        map.insert(114, handlers::sys_wait4);
        map.insert(118, handlers::sys_fsync);
        map.insert(140, handlers::sys_llseek);
        map.insert(145, handlers::sys_readv);
        map.insert(146, handlers::sys_writev);
        map.insert(180, handlers::sys_pread64);
        map.insert(181, handlers::sys_pwrite64);
        map.insert(183, handlers::sys_getcwd);
        map.insert(191, handlers::sys_ugetrlimit);
        map.insert(192, handlers::sys_mmap2);
        map.insert(194, handlers::sys_ftruncate64);
        map.insert(195, handlers::sys_stat64);
        map.insert(197, handlers::sys_fstat64);
        map.insert(220, handlers::sys_getdents64);
        map.insert(221, handlers::sys_fcntl64);
        map.insert(324, handlers::sys_fallocate);
        map.insert(340, handlers::sys_prlimit64);
        SyscallTable { handlers: map }
    }

    pub fn is_registered(&self, id: u32) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Run one syscall against the context. Unknown numbers report
    /// ENOSYS instead of aborting.
    pub fn dispatch(&self, id: u32, ctx: &mut SyscallContext) -> i32 {
        let handler = match self.handlers.get(&id) {
            Some(handler) => handler,
            None => {
                log::warn!("unimplemented syscall {}", id);
                ctx.set_errno(libc::ENOSYS);
                return -libc::ENOSYS;
            }
        };
        match handler(ctx) {
            Ok(ret) => ret,
            Err(err) => {
                let errno = err.errno();
                log::debug!("syscall {} failed: {}", id, err);
                ctx.set_errno(errno);
                -errno
            }
        }
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ConsoleDevice;
    use crate::heap::HeapConfig;

    fn context_parts() -> (Vfs, LinearMemory, HashMap<u32, MmapRecord>) {
        let mut vfs = Vfs::new();
        vfs.bootstrap(ConsoleDevice::to_log(), ConsoleDevice::to_error_log())
            .unwrap();
        (vfs, LinearMemory::new(HeapConfig::default()), HashMap::new())
    }

    #[test]
    fn test_unknown_syscall_reports_enosys() {
        let (mut vfs, mut heap, mut mappings) = context_parts();
        let errno_cell = heap.stack_alloc(4);
        let table = SyscallTable::new();
        let mut ctx = SyscallContext {
            vfs: &mut vfs,
            heap: &mut heap,
            mappings: &mut mappings,
            errno_location: Some(errno_cell),
            args: VarArgs::new(0),
        };
        assert_eq!(table.dispatch(9999, &mut ctx), -libc::ENOSYS);
        assert_eq!(ctx.heap.read_i32(errno_cell), libc::ENOSYS);
    }

    #[test]
    fn test_failure_writes_errno_cell() {
        let (mut vfs, mut heap, mut mappings) = context_parts();
        let errno_cell = heap.stack_alloc(4);
        let path_ptr = heap.stack_alloc(16);
        heap.write_cstr("/missing", path_ptr, 16);
        let argv = heap.stack_alloc(12);
        heap.write_i32(argv, path_ptr as i32);
        heap.write_i32(argv + 4, 0);
        heap.write_i32(argv + 8, 0);

        let table = SyscallTable::new();
        let mut ctx = SyscallContext {
            vfs: &mut vfs,
            heap: &mut heap,
            mappings: &mut mappings,
            errno_location: Some(errno_cell),
            args: VarArgs::new(argv),
        };
        // open("/missing", O_RDONLY)
        assert_eq!(table.dispatch(5, &mut ctx), -libc::ENOENT);
        assert_eq!(ctx.heap.read_i32(errno_cell), libc::ENOENT);
    }

    #[test]
    fn test_missing_errno_cell_is_tolerated() {
        let (mut vfs, mut heap, mut mappings) = context_parts();
        let table = SyscallTable::new();
        let mut ctx = SyscallContext {
            vfs: &mut vfs,
            heap: &mut heap,
            mappings: &mut mappings,
            errno_location: None,
            args: VarArgs::new(0),
        };
        assert_eq!(table.dispatch(9999, &mut ctx), -libc::ENOSYS);
    }

    #[test]
    fn test_registered_ids() {
        let table = SyscallTable::new();
        for id in [3, 4, 5, 6, 140, 195, 197, 220, 221, 324, 340] {
            assert!(table.is_registered(id), "syscall {} missing", id);
        }
        assert!(!table.is_registered(2));
        assert!(!table.is_registered(196));
    }
}
