//! File System Types
//!
//! Mode bits, open flags, attribute records and capability sets shared by
//! the node table, the backends and the descriptor table.

use std::collections::HashMap;

use bitflags::bitflags;

// ============================================================================
// Mode bits
// ============================================================================

pub const S_IFMT: u32 = 61440;
pub const S_IFDIR: u32 = 16384;
pub const S_IFREG: u32 = 32768;
pub const S_IFLNK: u32 = 40960;
pub const S_IFCHR: u32 = 8192;
pub const S_IFBLK: u32 = 24576;
pub const S_IFIFO: u32 = 4096;

/// Permission bits within a mode.
pub const MODE_PERM_MASK: u32 = 4095;

/// All read bits plus all execute bits.
pub const READ_MODE: u32 = 292 | 73;
/// All write bits.
pub const WRITE_MODE: u32 = 146;

pub fn is_file(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_link(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

pub fn is_chrdev(mode: u32) -> bool {
    mode & S_IFMT == S_IFCHR
}

pub fn is_blkdev(mode: u32) -> bool {
    mode & S_IFMT == S_IFBLK
}

pub fn is_fifo(mode: u32) -> bool {
    mode & S_IFMT == S_IFIFO
}

pub fn is_socket(mode: u32) -> bool {
    mode & 49152 == 49152
}

/// Whether every read and execute bit is set.
pub fn is_readable(mode: u32) -> bool {
    mode & READ_MODE == READ_MODE
}

/// Whether every write bit is set.
pub fn is_writable(mode: u32) -> bool {
    mode & WRITE_MODE == WRITE_MODE
}

// ============================================================================
// Open flags
// ============================================================================

pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_CREAT: u32 = 64;
pub const O_EXCL: u32 = 128;
pub const O_TRUNC: u32 = 512;
pub const O_APPEND: u32 = 1024;
pub const O_DIRECTORY: u32 = 65536;
pub const O_NOFOLLOW: u32 = 131072;

/// Access-mode mask used by the read/write stream predicates.
pub const ACCMODE_MASK: u32 = 2097155;

pub fn stream_is_read(flags: u32) -> bool {
    flags & ACCMODE_MASK != O_WRONLY
}

pub fn stream_is_write(flags: u32) -> bool {
    flags & ACCMODE_MASK != O_RDONLY
}

pub fn stream_is_append(flags: u32) -> bool {
    flags & O_APPEND != 0
}

lazy_static::lazy_static! {
    /// Open-mode strings to flag bitmasks, the table callers compiled against.
    static ref FLAG_MODES: HashMap<&'static str, u32> = {
        let mut m = HashMap::new();
        m.insert("r", 0);
        m.insert("rs", 1052672);
        m.insert("r+", 2);
        m.insert("w", 577);
        m.insert("wx", 705);
        m.insert("xw", 705);
        m.insert("w+", 578);
        m.insert("wx+", 706);
        m.insert("xw+", 706);
        m.insert("a", 1089);
        m.insert("ax", 1217);
        m.insert("xa", 1217);
        m.insert("a+", 1090);
        m.insert("ax+", 1218);
        m.insert("xa+", 1218);
        m
    };
}

/// Translate an open-mode string into flag bits. An unknown mode string is
/// a caller defect, not an I/O error.
pub fn mode_string_to_flags(mode: &str) -> u32 {
    match FLAG_MODES.get(mode) {
        Some(flags) => *flags,
        None => panic!("unknown file open mode: {}", mode),
    }
}

// ============================================================================
// Permission masks (rwx, the access() amode encoding)
// ============================================================================

pub const PERM_READ: u8 = 4;
pub const PERM_WRITE: u8 = 2;
pub const PERM_EXEC: u8 = 1;

/// The permissions an open with the given flags requires.
pub fn flags_to_perms(flags: u32) -> u8 {
    let mut perms = match flags & 3 {
        0 => PERM_READ,
        1 => PERM_WRITE,
        _ => PERM_READ | PERM_WRITE,
    };
    if flags & O_TRUNC != 0 {
        perms |= PERM_WRITE;
    }
    perms
}

// ============================================================================
// Seek origins
// ============================================================================

pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

// ============================================================================
// Device numbers
// ============================================================================

pub fn make_dev(major: u32, minor: u32) -> u32 {
    (major << 8) | minor
}

pub fn major_dev(dev: u32) -> u32 {
    dev >> 8
}

pub fn minor_dev(dev: u32) -> u32 {
    dev & 255
}

// ============================================================================
// Attributes
// ============================================================================

/// Result of a getattr, the source of every stat record.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub dev: u32,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    /// Epoch milliseconds; the stat record truncates to seconds.
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub blksize: u32,
    pub blocks: u32,
}

/// Partial attribute update consumed by setattr.
#[derive(Debug, Clone, Default)]
pub struct AttrPatch {
    pub mode: Option<u32>,
    pub timestamp_ms: Option<i64>,
    pub size: Option<u64>,
}

/// Result of mapping a stream into the linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapResult {
    pub ptr: u32,
    /// Whether the region was freshly allocated (and is freed on munmap)
    /// rather than aliasing existing bytes.
    pub allocated: bool,
}

// ============================================================================
// Capability sets
// ============================================================================

bitflags! {
    /// Node operations a backend implements for a given node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeCaps: u16 {
        const GETATTR = 1 << 0;
        const SETATTR = 1 << 1;
        const LOOKUP = 1 << 2;
        const MKNOD = 1 << 3;
        const RENAME = 1 << 4;
        const UNLINK = 1 << 5;
        const RMDIR = 1 << 6;
        const READDIR = 1 << 7;
        const SYMLINK = 1 << 8;
        const READLINK = 1 << 9;
    }
}

bitflags! {
    /// Stream operations available on descriptors opened on a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamCaps: u16 {
        const OPEN = 1 << 0;
        const CLOSE = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const LLSEEK = 1 << 4;
        const ALLOCATE = 1 << 5;
        const MMAP = 1 << 6;
        const MSYNC = 1 << 7;
        const IOCTL = 1 << 8;
    }
}

/// The node capabilities the in-memory backend grants per node kind.
pub fn default_node_caps(mode: u32) -> NodeCaps {
    if is_dir(mode) {
        NodeCaps::GETATTR
            | NodeCaps::SETATTR
            | NodeCaps::LOOKUP
            | NodeCaps::MKNOD
            | NodeCaps::RENAME
            | NodeCaps::UNLINK
            | NodeCaps::RMDIR
            | NodeCaps::READDIR
            | NodeCaps::SYMLINK
    } else if is_link(mode) {
        NodeCaps::GETATTR | NodeCaps::SETATTR | NodeCaps::READLINK
    } else {
        NodeCaps::GETATTR | NodeCaps::SETATTR
    }
}

/// The stream capabilities the in-memory backend grants per node kind.
pub fn default_stream_caps(mode: u32) -> StreamCaps {
    if is_dir(mode) {
        StreamCaps::LLSEEK
    } else if is_chrdev(mode) {
        StreamCaps::OPEN
    } else if is_link(mode) {
        StreamCaps::empty()
    } else {
        StreamCaps::LLSEEK
            | StreamCaps::READ
            | StreamCaps::WRITE
            | StreamCaps::ALLOCATE
            | StreamCaps::MMAP
            | StreamCaps::MSYNC
    }
}

/// Current time in epoch milliseconds, the node timestamp unit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
