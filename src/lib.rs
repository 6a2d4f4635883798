//! userland - A sandboxed POSIX-like filesystem and heap for native code
//!
//! This library provides a virtual filesystem with pluggable storage
//! backends, a linear-memory heap manager and a syscall dispatcher, so that
//! natively-compiled code can perform file I/O and dynamic allocation
//! against one flat byte buffer with no operating system underneath.

pub mod backend;
pub mod errors;
pub mod fs;
pub mod heap;
pub mod path;
pub mod sandbox;
pub mod syscall;

pub use errors::{StoreError, SyncError, VfsError};
pub use fs::Vfs;
pub use heap::{HeapConfig, LinearMemory};
pub use sandbox::{FileContent, FileEncoding, Sandbox, SandboxOptions};
pub use syscall::{SyscallTable, PROCESS_ID};
