//! Syscall Handlers
//!
//! One function per syscall number, decoding arguments from the block the
//! caller staged in linear memory and driving the filesystem. Returns
//! follow the kernel convention: non-negative results, or a negated errno.
//!
//! A handful of conditions return their errno directly instead of through
//! an error; those sites never touch the errno cell.

use crate::errors::VfsError;
use crate::fs::types::{FileAttr, SEEK_SET};
use crate::fs::Vfs;
use crate::heap::{LinearMemory, MMAP_PAGE_SIZE};
use crate::syscall::table::{MmapRecord, SyscallContext};

/// Process identity reported to the sandboxed program. There is exactly
/// one process, so the value is fixed.
pub const PROCESS_ID: i32 = 42;

// ----------------------------------------------------------------------
// shared decoding helpers

fn fd_usize(fd: i32, op: &str) -> Result<usize, VfsError> {
    usize::try_from(fd).map_err(|_| VfsError::bad_descriptor(op))
}

fn stream_path(vfs: &Vfs, fd: usize, op: &str) -> Result<String, VfsError> {
    match vfs.streams.get(fd) {
        Some(stream) => Ok(stream.path.clone()),
        None => Err(VfsError::bad_descriptor(op)),
    }
}

/// A negative byte count is invalid, but only on a descriptor that exists.
fn byte_count(vfs: &Vfs, fd: usize, count: i32, op: &str) -> Result<usize, VfsError> {
    let path = stream_path(vfs, fd, op)?;
    usize::try_from(count).map_err(|_| VfsError::invalid_argument(op, &path))
}

fn byte_offset(vfs: &Vfs, fd: usize, offset: i64, op: &str) -> Result<u64, VfsError> {
    let path = stream_path(vfs, fd, op)?;
    u64::try_from(offset).map_err(|_| VfsError::invalid_argument(op, &path))
}

/// Lay an attribute record out as the 76-byte stat shape the C library
/// expects, 32-bit fields with zeroed high halves.
fn write_stat(heap: &mut LinearMemory, buf: u32, attr: &FileAttr) {
    heap.write_i32(buf, attr.dev as i32);
    heap.write_i32(buf + 4, 0);
    heap.write_i32(buf + 8, attr.ino as i32);
    heap.write_i32(buf + 12, attr.mode as i32);
    heap.write_i32(buf + 16, attr.nlink as i32);
    heap.write_i32(buf + 20, attr.uid as i32);
    heap.write_i32(buf + 24, attr.gid as i32);
    heap.write_i32(buf + 28, attr.rdev as i32);
    heap.write_i32(buf + 32, 0);
    heap.write_i32(buf + 36, attr.size as i32);
    heap.write_i32(buf + 40, 4096);
    heap.write_i32(buf + 44, attr.blocks as i32);
    heap.write_i32(buf + 48, (attr.atime_ms / 1000) as i32);
    heap.write_i32(buf + 52, 0);
    heap.write_i32(buf + 56, (attr.mtime_ms / 1000) as i32);
    heap.write_i32(buf + 60, 0);
    heap.write_i32(buf + 64, (attr.ctime_ms / 1000) as i32);
    heap.write_i32(buf + 68, 0);
    heap.write_i32(buf + 72, attr.ino as i32);
}

fn do_stat(ctx: &mut SyscallContext, path: &str, buf: u32) -> Result<i32, VfsError> {
    let attr = match ctx.vfs.stat(path) {
        Ok(attr) => attr,
        // the denial names a component being traversed, not the target
        Err(VfsError::AccessDenied { .. }) => return Ok(-libc::ENOTDIR),
        Err(err) => return Err(err),
    };
    write_stat(ctx.heap, buf, &attr);
    Ok(0)
}

/// Copy a link target into `buf` without NUL termination: the terminator
/// the string write drops at the end is put back to whatever was there.
fn do_readlink(ctx: &mut SyscallContext, path: &str, buf: u32, bufsize: i32) -> Result<i32, VfsError> {
    if bufsize <= 0 {
        return Ok(-libc::EINVAL);
    }
    let target = ctx.vfs.readlink(path)?;
    let len = (bufsize as usize).min(target.len());
    let end = ctx.heap.read_u8(buf + len as u32);
    ctx.heap.write_cstr(&target, buf, bufsize as u32 + 1);
    ctx.heap.write_u8(buf + len as u32, end);
    Ok(len as i32)
}

fn do_readv(ctx: &mut SyscallContext, fd: usize, iov: u32, iovcnt: i32, op: &str) -> Result<i32, VfsError> {
    let mut total = 0i32;
    for i in 0..iovcnt {
        let base = iov + i as u32 * 8;
        let ptr = ctx.heap.read_u32(base);
        let len = ctx.heap.read_i32(base + 4);
        let len = byte_count(ctx.vfs, fd, len, op)?;
        let read = ctx.vfs.read(fd, ctx.heap.slice_mut(ptr, len), None)?;
        total += read as i32;
        if read < len {
            break;
        }
    }
    Ok(total)
}

fn do_writev(ctx: &mut SyscallContext, fd: usize, iov: u32, iovcnt: i32, op: &str) -> Result<i32, VfsError> {
    let mut total = 0i32;
    for i in 0..iovcnt {
        let base = iov + i as u32 * 8;
        let ptr = ctx.heap.read_u32(base);
        let len = ctx.heap.read_i32(base + 4);
        let len = byte_count(ctx.vfs, fd, len, op)?;
        let written = ctx.vfs.write(fd, ctx.heap.slice(ptr, len), None, false)?;
        total += written as i32;
    }
    Ok(total)
}

// ----------------------------------------------------------------------
// handlers by syscall number

/// 3: read
pub fn sys_read(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "read";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let buf = ctx.args.get(ctx.heap) as u32;
    let count = ctx.args.get(ctx.heap);
    let count = byte_count(ctx.vfs, fd, count, op)?;
    let read = ctx.vfs.read(fd, ctx.heap.slice_mut(buf, count), None)?;
    Ok(read as i32)
}

/// 4: write
pub fn sys_write(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "write";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let buf = ctx.args.get(ctx.heap) as u32;
    let count = ctx.args.get(ctx.heap);
    let count = byte_count(ctx.vfs, fd, count, op)?;
    let written = ctx.vfs.write(fd, ctx.heap.slice(buf, count), None, false)?;
    Ok(written as i32)
}

/// 5: open
pub fn sys_open(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    let flags = ctx.args.get(ctx.heap) as u32;
    let mode = ctx.args.get(ctx.heap) as u32;
    let fd = ctx.vfs.open(&path, flags, mode)?;
    Ok(fd as i32)
}

/// 6: close
pub fn sys_close(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let fd = fd_usize(ctx.args.get(ctx.heap), "close")?;
    ctx.vfs.close(fd)?;
    Ok(0)
}

/// 10: unlink
pub fn sys_unlink(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    ctx.vfs.unlink(&path)?;
    Ok(0)
}

/// 15: chmod
pub fn sys_chmod(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    let mode = ctx.args.get(ctx.heap) as u32;
    ctx.vfs.chmod(&path, mode)?;
    Ok(0)
}

/// 20: getpid
pub fn sys_getpid(_ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    Ok(PROCESS_ID)
}

/// 33: access
pub fn sys_access(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    let amode = ctx.args.get(ctx.heap) as u32;
    ctx.vfs.access(&path, amode)?;
    Ok(0)
}

/// 38: rename
pub fn sys_rename(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let old_path = ctx.args.get_str(ctx.heap);
    let new_path = ctx.args.get_str(ctx.heap);
    ctx.vfs.rename(&old_path, &new_path)?;
    Ok(0)
}

/// 54: ioctl. Terminal commands are answered here; everything the table
/// does not know is a defect in the calling code.
pub fn sys_ioctl(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "ioctl";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let request = ctx.args.get(ctx.heap);
    let tty = match ctx.vfs.streams.get(fd) {
        Some(stream) => stream.tty,
        None => return Err(VfsError::bad_descriptor(op)),
    };
    match request {
        // TCGETS, TCGETA
        21505 | 21509 => {
            if !tty {
                return Ok(-libc::ENOTTY);
            }
            Ok(0)
        }
        // TCSETS family: accepted and ignored, the terminal has no
        // settings to adjust
        21506 | 21507 | 21508 | 21510 | 21511 | 21512 => {
            if !tty {
                return Ok(-libc::ENOTTY);
            }
            Ok(0)
        }
        // TIOCGPGRP
        21519 => {
            if !tty {
                return Ok(-libc::ENOTTY);
            }
            let argp = ctx.args.get(ctx.heap) as u32;
            ctx.heap.write_i32(argp, 0);
            Ok(0)
        }
        // TIOCSPGRP
        21520 => {
            if !tty {
                return Ok(-libc::ENOTTY);
            }
            Ok(-libc::EINVAL)
        }
        // FIONREAD falls through to the stream, which never handles it
        21531 => {
            let _argp = ctx.args.get(ctx.heap);
            ctx.vfs.ioctl(fd, request as u32)
        }
        // TIOCGWINSZ, TIOCSWINSZ
        21523 | 21524 => {
            if !tty {
                return Ok(-libc::ENOTTY);
            }
            Ok(0)
        }
        _ => panic!("bad ioctl syscall {}", request),
    }
}

/// 77: getrusage. The counters are fabricated; only the record shape
/// matters to callers.
pub fn sys_getrusage(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let _who = ctx.args.get(ctx.heap);
    let usage = ctx.args.get(ctx.heap) as u32;
    ctx.heap.memset(usage, 0, 136);
    ctx.heap.write_i32(usage, 1);
    ctx.heap.write_i32(usage + 4, 2);
    ctx.heap.write_i32(usage + 8, 3);
    ctx.heap.write_i32(usage + 12, 4);
    Ok(0)
}

/// 83: symlink
pub fn sys_symlink(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let target = ctx.args.get_str(ctx.heap);
    let linkpath = ctx.args.get_str(ctx.heap);
    ctx.vfs.symlink(&target, &linkpath)?;
    Ok(0)
}

/// 85: readlink
pub fn sys_readlink(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    let buf = ctx.args.get(ctx.heap) as u32;
    let bufsize = ctx.args.get(ctx.heap);
    do_readlink(ctx, &path, buf, bufsize)
}

/// 91: munmap. Only whole mappings can be released; a length mismatch
/// leaves the mapping in place.
pub fn sys_munmap(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let addr = ctx.args.get(ctx.heap) as u32;
    let len = ctx.args.get(ctx.heap) as u32;
    let info = match ctx.mappings.get(&addr) {
        Some(info) => info.clone(),
        None => return Ok(0),
    };
    if len == info.len {
        if info.fd >= 0 {
            // write the view back before the pages go away
            ctx.vfs
                .msync(info.fd as usize, ctx.heap.slice(addr, len as usize), 0, info.flags)?;
        }
        ctx.mappings.remove(&addr);
        if info.allocated {
            ctx.heap.free(info.malloc);
        }
    }
    Ok(0)
}

/// 94: fchmod
pub fn sys_fchmod(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let fd = fd_usize(ctx.args.get(ctx.heap), "fchmod")?;
    let mode = ctx.args.get(ctx.heap) as u32;
    ctx.vfs.fchmod(fd, mode)?;
    Ok(0)
}

/// 114: wait4
pub fn sys_wait4(_ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    panic!("cannot wait on child processes");
}

/// 118: fsync. Writes land in memory immediately, so a live descriptor
/// is all there is to check.
pub fn sys_fsync(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "fsync";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    if ctx.vfs.streams.get(fd).is_none() {
        return Err(VfsError::bad_descriptor(op));
    }
    Ok(0)
}

/// 140: llseek. The high offset word is discarded; the resulting
/// position is reported through a single 32-bit cell.
pub fn sys_llseek(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "llseek";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let _offset_high = ctx.args.get(ctx.heap);
    let offset_low = ctx.args.get(ctx.heap);
    let result = ctx.args.get(ctx.heap) as u32;
    let whence = ctx.args.get(ctx.heap) as u32;
    let offset = offset_low as i64;
    let position = ctx.vfs.llseek(fd, offset, whence)?;
    ctx.heap.write_i32(result, position as i32);
    if offset == 0 && whence == SEEK_SET {
        // a rewind restarts directory iteration
        if let Some(stream) = ctx.vfs.streams.get_mut(fd) {
            stream.getdents = None;
        }
    }
    Ok(0)
}

/// 145: readv
pub fn sys_readv(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "readv";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let iov = ctx.args.get(ctx.heap) as u32;
    let iovcnt = ctx.args.get(ctx.heap);
    do_readv(ctx, fd, iov, iovcnt, op)
}

/// 146: writev
pub fn sys_writev(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "writev";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let iov = ctx.args.get(ctx.heap) as u32;
    let iovcnt = ctx.args.get(ctx.heap);
    do_writev(ctx, fd, iov, iovcnt, op)
}

/// 180: pread64
pub fn sys_pread64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "pread64";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let buf = ctx.args.get(ctx.heap) as u32;
    let count = ctx.args.get(ctx.heap);
    ctx.args.get_zero(ctx.heap);
    let offset = ctx.args.get64(ctx.heap);
    let count = byte_count(ctx.vfs, fd, count, op)?;
    let offset = byte_offset(ctx.vfs, fd, offset, op)?;
    let read = ctx.vfs.read(fd, ctx.heap.slice_mut(buf, count), Some(offset))?;
    Ok(read as i32)
}

/// 181: pwrite64
pub fn sys_pwrite64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "pwrite64";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let buf = ctx.args.get(ctx.heap) as u32;
    let count = ctx.args.get(ctx.heap);
    ctx.args.get_zero(ctx.heap);
    let offset = ctx.args.get64(ctx.heap);
    let count = byte_count(ctx.vfs, fd, count, op)?;
    let offset = byte_offset(ctx.vfs, fd, offset, op)?;
    let written = ctx.vfs.write(fd, ctx.heap.slice(buf, count), Some(offset), false)?;
    Ok(written as i32)
}

/// 183: getcwd. On success the return value is the buffer address.
pub fn sys_getcwd(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let buf = ctx.args.get(ctx.heap) as u32;
    let size = ctx.args.get(ctx.heap);
    if size == 0 {
        return Ok(-libc::EINVAL);
    }
    let cwd = ctx.vfs.cwd().to_string();
    if (size as i64) < cwd.len() as i64 + 1 {
        return Ok(-libc::ERANGE);
    }
    ctx.heap.write_cstr(&cwd, buf, size as u32);
    Ok(buf as i32)
}

/// 191: ugetrlimit. Every resource reports no limit.
pub fn sys_ugetrlimit(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let _resource = ctx.args.get(ctx.heap);
    let rlim = ctx.args.get(ctx.heap) as u32;
    ctx.heap.write_i32(rlim, -1);
    ctx.heap.write_i32(rlim + 4, -1);
    ctx.heap.write_i32(rlim + 8, -1);
    ctx.heap.write_i32(rlim + 12, -1);
    Ok(0)
}

/// 192: mmap2. The address hint is ignored; anonymous mappings come from
/// the allocator, file mappings from the backing stream.
pub fn sys_mmap2(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let _addr = ctx.args.get(ctx.heap);
    let len = ctx.args.get(ctx.heap) as u32;
    let prot = ctx.args.get(ctx.heap) as u32;
    let flags = ctx.args.get(ctx.heap) as u32;
    let fd = ctx.args.get(ctx.heap);
    let off = ctx.args.get(ctx.heap);
    // the offset argument arrives in pages
    let position = ((off as u32) as u64) << 12;
    let (ptr, allocated) = if fd == -1 {
        let ptr = ctx.heap.memalign(MMAP_PAGE_SIZE, len);
        if ptr == 0 {
            return Ok(-libc::ENOMEM);
        }
        ctx.heap.memset(ptr, 0, len as usize);
        (ptr, true)
    } else {
        let fd = match usize::try_from(fd) {
            Ok(fd) if ctx.vfs.streams.is_open(fd) => fd,
            _ => return Ok(-libc::EBADF),
        };
        let result = ctx.vfs.mmap(fd, ctx.heap, len as usize, prot, flags, position)?;
        (result.ptr, result.allocated)
    };
    ctx.mappings.insert(
        ptr,
        MmapRecord {
            malloc: ptr,
            len,
            allocated,
            fd,
            flags,
        },
    );
    Ok(ptr as i32)
}

/// 194: ftruncate64
pub fn sys_ftruncate64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let fd = fd_usize(ctx.args.get(ctx.heap), "ftruncate")?;
    ctx.args.get_zero(ctx.heap);
    let length = ctx.args.get64(ctx.heap);
    ctx.vfs.ftruncate(fd, length)?;
    Ok(0)
}

/// 195: stat64
pub fn sys_stat64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let path = ctx.args.get_str(ctx.heap);
    let buf = ctx.args.get(ctx.heap) as u32;
    do_stat(ctx, &path, buf)
}

/// 197: fstat64
pub fn sys_fstat64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let fd = fd_usize(ctx.args.get(ctx.heap), "fstat")?;
    let buf = ctx.args.get(ctx.heap) as u32;
    let path = stream_path(ctx.vfs, fd, "fstat")?;
    do_stat(ctx, &path, buf)
}

/// 220: getdents64. Names pop from the tail of a listing cached on the
/// stream; dot entries report the root inode.
pub fn sys_getdents64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "getdents";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let dirp = ctx.args.get(ctx.heap) as u32;
    let count = ctx.args.get(ctx.heap);
    let path = stream_path(ctx.vfs, fd, op)?;
    let primed = ctx
        .vfs
        .streams
        .get(fd)
        .map_or(false, |stream| stream.getdents.is_some());
    if !primed {
        let names = ctx.vfs.readdir(&path)?;
        if let Some(stream) = ctx.vfs.streams.get_mut(fd) {
            stream.getdents = Some(names);
        }
    }
    let mut pos = 0i32;
    while pos + 268 <= count {
        let (name, dir_node, position) = {
            let stream = match ctx.vfs.streams.get_mut(fd) {
                Some(stream) => stream,
                None => return Err(VfsError::bad_descriptor(op)),
            };
            let name = match stream.getdents.as_mut().and_then(|names| names.pop()) {
                Some(name) => name,
                None => break,
            };
            (name, stream.node, stream.position)
        };
        let (id, dtype) = if name.starts_with('.') {
            (1i32, 4u8)
        } else {
            let child = ctx.vfs.lookup_node(dir_node, &name, op, &path)?;
            let node = ctx.vfs.nodes.node(child);
            let dtype = if node.is_chrdev() {
                2
            } else if node.is_dir() {
                4
            } else if node.is_link() {
                10
            } else {
                8
            };
            (child.as_u64() as i32, dtype)
        };
        let base = dirp + pos as u32;
        ctx.heap.write_i32(base, id);
        ctx.heap.write_i32(base + 4, position as i32);
        ctx.heap.write_u16(base + 8, 268);
        ctx.heap.write_u8(base + 10, dtype);
        ctx.heap.write_cstr(&name, base + 11, 256);
        pos += 268;
    }
    Ok(pos)
}

/// 221: fcntl64
pub fn sys_fcntl64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let op = "fcntl";
    let fd = fd_usize(ctx.args.get(ctx.heap), op)?;
    let cmd = ctx.args.get(ctx.heap);
    let (path, flags) = {
        let stream = match ctx.vfs.streams.get(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        (stream.path.clone(), stream.flags)
    };
    match cmd {
        // F_DUPFD: reopen at the lowest descriptor at or above the hint
        0 => {
            let arg = ctx.args.get(ctx.heap);
            if arg < 0 {
                return Ok(-libc::EINVAL);
            }
            let new_fd = ctx.vfs.open_at(&path, flags, 0, arg as usize)?;
            Ok(new_fd as i32)
        }
        // F_GETFD/F_SETFD: close-on-exec has no meaning here
        1 | 2 => Ok(0),
        // F_GETFL
        3 => Ok(flags as i32),
        // F_SETFL
        4 => {
            let arg = ctx.args.get(ctx.heap) as u32;
            if let Some(stream) = ctx.vfs.streams.get_mut(fd) {
                stream.flags |= arg;
            }
            Ok(0)
        }
        // F_GETLK: every probe sees the file unlocked
        12 => {
            let arg = ctx.args.get(ctx.heap) as u32;
            ctx.heap.write_u16(arg, 2);
            Ok(0)
        }
        // F_SETLK/F_SETLKW: lock requests always succeed
        13 | 14 => Ok(0),
        8 | 16 => Ok(-libc::EINVAL),
        // F_GETOWN overlaps the error range, so the failure goes through
        // the errno cell and the return value stays -1
        9 => {
            ctx.set_errno(libc::EINVAL);
            Ok(-1)
        }
        _ => Ok(-libc::EINVAL),
    }
}

/// 324: fallocate
pub fn sys_fallocate(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let fd = fd_usize(ctx.args.get(ctx.heap), "fallocate")?;
    let mode = ctx.args.get(ctx.heap);
    let offset = ctx.args.get64(ctx.heap);
    let len = ctx.args.get64(ctx.heap);
    assert_eq!(mode, 0);
    ctx.vfs.allocate(fd, offset, len)?;
    Ok(0)
}

/// 340: prlimit64. Reports no limits, adjusts nothing.
pub fn sys_prlimit64(ctx: &mut SyscallContext) -> Result<i32, VfsError> {
    let _pid = ctx.args.get(ctx.heap);
    let _resource = ctx.args.get(ctx.heap);
    let _new_limit = ctx.args.get(ctx.heap);
    let old_limit = ctx.args.get(ctx.heap) as u32;
    if old_limit != 0 {
        ctx.heap.write_i32(old_limit, -1);
        ctx.heap.write_i32(old_limit + 4, -1);
        ctx.heap.write_i32(old_limit + 8, -1);
        ctx.heap.write_i32(old_limit + 12, -1);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::types::{O_CREAT, O_DIRECTORY, O_RDWR, O_TRUNC, O_WRONLY, S_IFREG};
    use crate::fs::ConsoleDevice;
    use crate::heap::HeapConfig;
    use crate::syscall::args::VarArgs;
    use crate::syscall::table::SyscallHandler;
    use std::collections::HashMap;

    struct Fixture {
        vfs: Vfs,
        heap: LinearMemory,
        mappings: HashMap<u32, MmapRecord>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut vfs = Vfs::new();
            vfs.bootstrap(ConsoleDevice::to_log(), ConsoleDevice::to_error_log())
                .unwrap();
            Fixture {
                vfs,
                heap: LinearMemory::new(HeapConfig::default()),
                mappings: HashMap::new(),
            }
        }

        fn push_args(&mut self, args: &[i32]) -> u32 {
            let ptr = self.heap.stack_alloc(args.len() as u32 * 4);
            for (i, arg) in args.iter().enumerate() {
                self.heap.write_i32(ptr + i as u32 * 4, *arg);
            }
            ptr
        }

        fn call(&mut self, handler: SyscallHandler, args: &[i32]) -> i32 {
            self.call_with_errno(handler, args, None)
        }

        fn call_with_errno(
            &mut self,
            handler: SyscallHandler,
            args: &[i32],
            errno_location: Option<u32>,
        ) -> i32 {
            let ptr = self.push_args(args);
            let mut ctx = SyscallContext {
                vfs: &mut self.vfs,
                heap: &mut self.heap,
                mappings: &mut self.mappings,
                errno_location,
                args: VarArgs::new(ptr),
            };
            match handler(&mut ctx) {
                Ok(ret) => ret,
                Err(err) => -err.errno(),
            }
        }

        fn cstr(&mut self, s: &str) -> i32 {
            let ptr = self.heap.stack_alloc(s.len() as u32 + 1);
            self.heap.write_cstr(s, ptr, s.len() as u32 + 1);
            ptr as i32
        }

        fn buffer(&mut self, len: u32) -> u32 {
            self.heap.stack_alloc(len)
        }
    }

    #[test]
    fn test_getpid_is_fixed() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(sys_getpid, &[]), PROCESS_ID);
    }

    #[test]
    fn test_open_write_close_read_round_trip() {
        let mut fx = Fixture::new();
        let path = fx.cstr("/notes.txt");
        let flags = (O_CREAT | O_WRONLY | O_TRUNC) as i32;
        let fd = fx.call(sys_open, &[path, flags, 438]);
        assert!(fd >= 3);

        let data = fx.cstr("persistent bytes");
        assert_eq!(fx.call(sys_write, &[fd, data, 16]), 16);
        assert_eq!(fx.call(sys_close, &[fd]), 0);

        let fd = fx.call(sys_open, &[path, 0, 0]);
        let buf = fx.buffer(32);
        assert_eq!(fx.call(sys_read, &[fd, buf as i32, 32]), 16);
        assert_eq!(fx.heap.slice(buf, 16), b"persistent bytes");
        assert_eq!(fx.call(sys_read, &[fd, buf as i32, 32]), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let mut fx = Fixture::new();
        let path = fx.cstr("/no/such/file");
        assert_eq!(fx.call(sys_open, &[path, 0, 0]), -libc::ENOENT);
    }

    #[test]
    fn test_pread_and_pwrite_honor_offsets() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/digits", b"0123456789").unwrap();
        let path = fx.cstr("/digits");
        let fd = fx.call(sys_open, &[path, O_RDWR as i32, 0]);

        let buf = fx.buffer(8);
        assert_eq!(fx.call(sys_pread64, &[fd, buf as i32, 4, 0, 6, 0]), 4);
        assert_eq!(fx.heap.slice(buf, 4), b"6789");

        let patch = fx.cstr("XY");
        assert_eq!(fx.call(sys_pwrite64, &[fd, patch, 2, 0, 2, 0]), 2);
        assert_eq!(fx.vfs.read_file("/digits").unwrap(), b"01XY456789");
        // positional transfers leave the cursor at the start
        let buf = fx.buffer(4);
        assert_eq!(fx.call(sys_read, &[fd, buf as i32, 2]), 2);
        assert_eq!(fx.heap.slice(buf, 2), b"01");
    }

    #[test]
    fn test_vectored_io() {
        let mut fx = Fixture::new();
        let path = fx.cstr("/vec.txt");
        let flags = (O_CREAT | O_RDWR) as i32;
        let fd = fx.call(sys_open, &[path, flags, 438]);

        let first = fx.cstr("alpha ");
        let second = fx.cstr("beta");
        let iov = fx.buffer(16);
        fx.heap.write_i32(iov, first);
        fx.heap.write_i32(iov + 4, 6);
        fx.heap.write_i32(iov + 8, second);
        fx.heap.write_i32(iov + 12, 4);
        assert_eq!(fx.call(sys_writev, &[fd, iov as i32, 2]), 10);
        assert_eq!(fx.vfs.read_file("/vec.txt").unwrap(), b"alpha beta");

        // rewind, then scatter the bytes back across two buffers
        let result = fx.buffer(4);
        assert_eq!(fx.call(sys_llseek, &[fd, 0, 0, result as i32, 0]), 0);
        let a = fx.buffer(6);
        let b = fx.buffer(16);
        let iov = fx.buffer(16);
        fx.heap.write_i32(iov, a as i32);
        fx.heap.write_i32(iov + 4, 6);
        fx.heap.write_i32(iov + 8, b as i32);
        fx.heap.write_i32(iov + 12, 16);
        assert_eq!(fx.call(sys_readv, &[fd, iov as i32, 2]), 10);
        assert_eq!(fx.heap.slice(a, 6), b"alpha ");
        assert_eq!(fx.heap.slice(b, 4), b"beta");
    }

    #[test]
    fn test_getcwd_size_checks() {
        let mut fx = Fixture::new();
        fx.vfs.mkdir("/workdir", 511).unwrap();
        fx.vfs.chdir("/workdir").unwrap();
        let buf = fx.buffer(32);
        assert_eq!(fx.call(sys_getcwd, &[buf as i32, 0]), -libc::EINVAL);
        assert_eq!(fx.call(sys_getcwd, &[buf as i32, 4]), -libc::ERANGE);
        assert_eq!(fx.call(sys_getcwd, &[buf as i32, 32]), buf as i32);
        assert_eq!(fx.heap.read_cstr(buf), "/workdir");
    }

    #[test]
    fn test_readlink_truncates_and_restores() {
        let mut fx = Fixture::new();
        // /dev/stdin points at /dev/tty
        let path = fx.cstr("/dev/stdin");
        let buf = fx.buffer(16);
        fx.heap.memset(buf, 0xAA, 16);

        assert_eq!(fx.call(sys_readlink, &[path, buf as i32, 16]), 8);
        assert_eq!(fx.heap.slice(buf, 8), b"/dev/tty");
        // the byte after the target is restored, not NUL terminated
        assert_eq!(fx.heap.read_u8(buf + 8), 0xAA);

        fx.heap.memset(buf, 0xAA, 16);
        assert_eq!(fx.call(sys_readlink, &[path, buf as i32, 4]), 4);
        assert_eq!(fx.heap.slice(buf, 4), b"/dev");
        assert_eq!(fx.heap.read_u8(buf + 4), 0xAA);

        assert_eq!(fx.call(sys_readlink, &[path, buf as i32, 0]), -libc::EINVAL);
    }

    #[test]
    fn test_llseek_writes_position_cell() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/seek.bin", b"0123456789").unwrap();
        let path = fx.cstr("/seek.bin");
        let fd = fx.call(sys_open, &[path, 0, 0]);
        let result = fx.buffer(4);

        // offset words arrive high first
        assert_eq!(fx.call(sys_llseek, &[fd, 0, 6, result as i32, 0]), 0);
        assert_eq!(fx.heap.read_i32(result), 6);
        assert_eq!(fx.call(sys_llseek, &[fd, 0, 0, result as i32, 2]), 0);
        assert_eq!(fx.heap.read_i32(result), 10);

        let dev = fx.cstr("/dev/urandom");
        let dev_fd = fx.call(sys_open, &[dev, 0, 0]);
        assert_eq!(
            fx.call(sys_llseek, &[dev_fd, 0, 0, result as i32, 0]),
            -libc::ESPIPE
        );
    }

    #[test]
    fn test_getdents_paginates() {
        let mut fx = Fixture::new();
        fx.vfs.mkdir("/lib", 511).unwrap();
        fx.vfs.write_file("/lib/a.so", b"a").unwrap();
        fx.vfs.write_file("/lib/b.so", b"b").unwrap();
        let path = fx.cstr("/lib");
        let fd = fx.call(sys_open, &[path, O_DIRECTORY as i32, 0]);
        let dirp = fx.buffer(268 * 4);

        // room for two records; names come tail first
        assert_eq!(fx.call(sys_getdents64, &[fd, dirp as i32, 600]), 536);
        assert_eq!(fx.heap.read_cstr(dirp + 11), "b.so");
        assert_eq!(fx.heap.read_u16(dirp + 8), 268);
        assert_eq!(fx.heap.read_u8(dirp + 10), 8);
        assert!(fx.heap.read_i32(dirp) > 1);
        assert_eq!(fx.heap.read_cstr(dirp + 268 + 11), "a.so");

        // the dot entries drain next, pinned to the root inode
        assert_eq!(fx.call(sys_getdents64, &[fd, dirp as i32, 600]), 536);
        assert_eq!(fx.heap.read_cstr(dirp + 11), "..");
        assert_eq!(fx.heap.read_i32(dirp), 1);
        assert_eq!(fx.heap.read_u8(dirp + 10), 4);
        assert_eq!(fx.heap.read_cstr(dirp + 268 + 11), ".");

        assert_eq!(fx.call(sys_getdents64, &[fd, dirp as i32, 600]), 0);

        // rewinding the descriptor restarts the listing
        let result = fx.buffer(4);
        assert_eq!(fx.call(sys_llseek, &[fd, 0, 0, result as i32, 0]), 0);
        assert_eq!(fx.call(sys_getdents64, &[fd, dirp as i32, 2000]), 268 * 4);
    }

    #[test]
    fn test_stat_record_layout() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/sized.bin", b"hello world").unwrap();
        let path = fx.cstr("/sized.bin");
        let buf = fx.buffer(76);
        assert_eq!(fx.call(sys_stat64, &[path, buf as i32]), 0);

        assert_eq!(fx.heap.read_i32(buf + 12) as u32, S_IFREG | 438);
        assert_eq!(fx.heap.read_i32(buf + 36), 11);
        assert_eq!(fx.heap.read_i32(buf + 40), 4096);
        assert_eq!(fx.heap.read_i32(buf + 4), 0);
        let ino = fx.heap.read_i32(buf + 8);
        assert!(ino > 0);
        assert_eq!(fx.heap.read_i32(buf + 72), ino);
        assert!(fx.heap.read_i32(buf + 56) > 0);
    }

    #[test]
    fn test_stat_path_through_file_is_enotdir() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/plain.txt", b"x").unwrap();
        let path = fx.cstr("/plain.txt/sub");
        let buf = fx.buffer(76);
        assert_eq!(fx.call(sys_stat64, &[path, buf as i32]), -libc::ENOTDIR);

        let missing = fx.cstr("/gone");
        assert_eq!(fx.call(sys_stat64, &[missing, buf as i32]), -libc::ENOENT);
    }

    #[test]
    fn test_fstat_matches_stat() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/same.txt", b"abc").unwrap();
        let path = fx.cstr("/same.txt");
        let fd = fx.call(sys_open, &[path, 0, 0]);
        let via_fd = fx.buffer(76);
        let via_path = fx.buffer(76);
        assert_eq!(fx.call(sys_fstat64, &[fd, via_fd as i32]), 0);
        assert_eq!(fx.call(sys_stat64, &[path, via_path as i32]), 0);
        assert_eq!(fx.heap.read_i32(via_fd + 8), fx.heap.read_i32(via_path + 8));
        assert_eq!(fx.heap.read_i32(via_fd + 36), 3);

        assert_eq!(fx.call(sys_fstat64, &[99, via_fd as i32]), -libc::EBADF);
    }

    #[test]
    fn test_chmod_and_fchmod() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/m.txt", b"m").unwrap();
        let path = fx.cstr("/m.txt");
        assert_eq!(fx.call(sys_chmod, &[path, 384]), 0);
        assert_eq!(fx.vfs.stat("/m.txt").unwrap().mode, S_IFREG | 384);

        let fd = fx.call(sys_open, &[path, O_RDWR as i32, 0]);
        assert_eq!(fx.call(sys_fchmod, &[fd, 511]), 0);
        assert_eq!(fx.vfs.stat("/m.txt").unwrap().mode, S_IFREG | 511);
        assert_eq!(fx.call(sys_fchmod, &[99, 511]), -libc::EBADF);
    }

    #[test]
    fn test_ftruncate_and_fallocate_resize() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/grow.bin", b"abc").unwrap();
        let path = fx.cstr("/grow.bin");
        let fd = fx.call(sys_open, &[path, O_RDWR as i32, 0]);

        assert_eq!(fx.call(sys_ftruncate64, &[fd, 0, 100, 0]), 0);
        assert_eq!(fx.vfs.stat("/grow.bin").unwrap().size, 100);

        assert_eq!(fx.call(sys_fallocate, &[fd, 0, 0, 0, 4096, 0]), 0);
        assert_eq!(fx.vfs.stat("/grow.bin").unwrap().size, 4096);
    }

    #[test]
    fn test_fsync_checks_descriptor() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/f.txt", b"f").unwrap();
        let path = fx.cstr("/f.txt");
        let fd = fx.call(sys_open, &[path, 0, 0]);
        assert_eq!(fx.call(sys_fsync, &[fd]), 0);
        assert_eq!(fx.call(sys_fsync, &[4000]), -libc::EBADF);
    }

    #[test]
    fn test_link_and_rename_calls() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/orig.txt", b"body").unwrap();

        let target = fx.cstr("/orig.txt");
        let link = fx.cstr("/alias");
        assert_eq!(fx.call(sys_symlink, &[target, link]), 0);
        let buf = fx.buffer(32);
        assert_eq!(fx.call(sys_readlink, &[link, buf as i32, 32]), 9);
        assert_eq!(fx.heap.slice(buf, 9), b"/orig.txt");

        let renamed = fx.cstr("/moved.txt");
        assert_eq!(fx.call(sys_rename, &[target, renamed]), 0);
        assert!(fx.vfs.stat("/orig.txt").is_err());
        assert_eq!(fx.vfs.read_file("/moved.txt").unwrap(), b"body");

        assert_eq!(fx.call(sys_unlink, &[renamed]), 0);
        assert!(fx.vfs.stat("/moved.txt").is_err());
        assert_eq!(fx.call(sys_unlink, &[renamed]), -libc::ENOENT);
    }

    #[test]
    fn test_access_modes() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/guarded", b"g").unwrap();
        let path = fx.cstr("/guarded");
        assert_eq!(fx.call(sys_access, &[path, 0]), 0);
        assert_eq!(fx.call(sys_access, &[path, 7]), 0);
        assert_eq!(fx.call(sys_access, &[path, 8]), -libc::EINVAL);

        let missing = fx.cstr("/absent");
        assert_eq!(fx.call(sys_access, &[missing, 0]), -libc::ENOENT);

        fx.vfs.chmod("/guarded", 0).unwrap();
        fx.vfs.check_permissions = true;
        assert_eq!(fx.call(sys_access, &[path, 4]), -libc::EACCES);
        assert_eq!(fx.call(sys_access, &[path, 0]), 0);
    }

    #[test]
    fn test_fcntl_commands() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/dup.me", b"d").unwrap();
        let path = fx.cstr("/dup.me");
        let fd = fx.call(sys_open, &[path, 0, 0]);

        // duplicate above a floor, then confirm both read the same file
        let dup = fx.call(sys_fcntl64, &[fd, 0, 20]);
        assert_eq!(dup, 20);
        let buf = fx.buffer(4);
        assert_eq!(fx.call(sys_read, &[dup, buf as i32, 1]), 1);
        assert_eq!(fx.call(sys_fcntl64, &[fd, 0, -1]), -libc::EINVAL);

        assert_eq!(fx.call(sys_fcntl64, &[fd, 3]), 0);
        assert_eq!(fx.call(sys_fcntl64, &[fd, 1]), 0);
        assert_eq!(fx.call(sys_fcntl64, &[fd, 13]), 0);

        let lock = fx.buffer(16);
        assert_eq!(fx.call(sys_fcntl64, &[fd, 12, lock as i32]), 0);
        assert_eq!(fx.heap.read_u16(lock), 2);

        let errno_cell = fx.buffer(4);
        assert_eq!(
            fx.call_with_errno(sys_fcntl64, &[fd, 9], Some(errno_cell)),
            -1
        );
        assert_eq!(fx.heap.read_i32(errno_cell), libc::EINVAL);

        assert_eq!(fx.call(sys_fcntl64, &[fd, 99]), -libc::EINVAL);
        assert_eq!(fx.call(sys_fcntl64, &[1234, 3]), -libc::EBADF);
    }

    #[test]
    fn test_ioctl_terminal_commands() {
        let mut fx = Fixture::new();
        let tty = fx.cstr("/dev/tty");
        let fd = fx.call(sys_open, &[tty, O_RDWR as i32, 0]);
        assert_eq!(fx.call(sys_ioctl, &[fd, 21505]), 0);
        assert_eq!(fx.call(sys_ioctl, &[fd, 21506]), 0);
        assert_eq!(fx.call(sys_ioctl, &[fd, 21523]), 0);
        assert_eq!(fx.call(sys_ioctl, &[fd, 21520]), -libc::EINVAL);

        let pgrp = fx.buffer(4);
        fx.heap.write_i32(pgrp, 77);
        assert_eq!(fx.call(sys_ioctl, &[fd, 21519, pgrp as i32]), 0);
        assert_eq!(fx.heap.read_i32(pgrp), 0);

        fx.vfs.write_file("/not-a-tty", b"x").unwrap();
        let plain = fx.cstr("/not-a-tty");
        let plain_fd = fx.call(sys_open, &[plain, 0, 0]);
        assert_eq!(fx.call(sys_ioctl, &[plain_fd, 21505]), -libc::ENOTTY);
        assert_eq!(
            fx.call(sys_ioctl, &[plain_fd, 21531, pgrp as i32]),
            -libc::ENOTTY
        );
    }

    #[test]
    #[should_panic(expected = "bad ioctl syscall")]
    fn test_ioctl_unknown_command_panics() {
        let mut fx = Fixture::new();
        let tty = fx.cstr("/dev/tty");
        let fd = fx.call(sys_open, &[tty, O_RDWR as i32, 0]);
        fx.call(sys_ioctl, &[fd, 12345]);
    }

    #[test]
    #[should_panic(expected = "cannot wait on child processes")]
    fn test_wait4_panics() {
        let mut fx = Fixture::new();
        fx.call(sys_wait4, &[]);
    }

    #[test]
    fn test_mmap_anonymous_zeroed() {
        let mut fx = Fixture::new();
        let ptr = fx.call(sys_mmap2, &[0, 8192, 3, 34, -1, 0]);
        assert!(ptr > 0);
        assert_eq!(ptr as u32 % MMAP_PAGE_SIZE, 0);
        assert!(fx.heap.slice(ptr as u32, 8192).iter().all(|&b| b == 0));

        let record = fx.mappings.get(&(ptr as u32)).unwrap();
        assert!(record.allocated);
        assert_eq!(record.fd, -1);
        assert_eq!(record.len, 8192);

        assert_eq!(fx.call(sys_munmap, &[ptr, 8192]), 0);
        assert!(fx.mappings.is_empty());
    }

    #[test]
    fn test_mmap_file_backed_write_back() {
        let mut fx = Fixture::new();
        fx.vfs.write_file("/map.bin", b"abcdefgh").unwrap();
        let path = fx.cstr("/map.bin");
        let fd = fx.call(sys_open, &[path, O_RDWR as i32, 0]);

        // MAP_SHARED
        let ptr = fx.call(sys_mmap2, &[0, 8, 3, 1, fd, 0]);
        assert!(ptr > 0);
        assert_eq!(fx.heap.slice(ptr as u32, 8), b"abcdefgh");

        fx.heap.write_bytes(ptr as u32, b"ZZ");
        assert_eq!(fx.call(sys_munmap, &[ptr, 8]), 0);
        assert_eq!(fx.vfs.read_file("/map.bin").unwrap(), b"ZZcdefgh");

        // a length mismatch leaves the mapping registered
        let ptr = fx.call(sys_mmap2, &[0, 8, 3, 1, fd, 0]);
        assert_eq!(fx.call(sys_munmap, &[ptr, 4]), 0);
        assert!(fx.mappings.contains_key(&(ptr as u32)));

        assert_eq!(fx.call(sys_mmap2, &[0, 8, 3, 1, 77, 0]), -libc::EBADF);
    }

    #[test]
    fn test_munmap_unknown_address_is_noop() {
        let mut fx = Fixture::new();
        assert_eq!(fx.call(sys_munmap, &[123456, 8192]), 0);
    }

    #[test]
    fn test_resource_stubs_fill_records() {
        let mut fx = Fixture::new();
        let usage = fx.buffer(136);
        fx.heap.memset(usage, 0xFF, 136);
        assert_eq!(fx.call(sys_getrusage, &[0, usage as i32]), 0);
        assert_eq!(fx.heap.read_i32(usage), 1);
        assert_eq!(fx.heap.read_i32(usage + 4), 2);
        assert_eq!(fx.heap.read_i32(usage + 8), 3);
        assert_eq!(fx.heap.read_i32(usage + 12), 4);
        assert!(fx.heap.slice(usage + 16, 120).iter().all(|&b| b == 0));

        let rlim = fx.buffer(16);
        assert_eq!(fx.call(sys_ugetrlimit, &[7, rlim as i32]), 0);
        for word in 0..4 {
            assert_eq!(fx.heap.read_i32(rlim + word * 4), -1);
        }

        let old = fx.buffer(16);
        fx.heap.memset(old, 0, 16);
        assert_eq!(fx.call(sys_prlimit64, &[42, 7, 0, old as i32]), 0);
        assert_eq!(fx.heap.read_i32(old), -1);
        assert_eq!(fx.call(sys_prlimit64, &[42, 7, 0, 0]), 0);
    }
}
