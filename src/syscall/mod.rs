//! System Call Layer
//!
//! The numeric boundary between a program compiled against the sandbox
//! and the filesystem underneath it. Arguments travel through linear
//! memory, results come back as non-negative values or negated errnos.

pub mod args;
pub mod handlers;
pub mod table;

pub use args::VarArgs;
pub use handlers::PROCESS_ID;
pub use table::{MmapRecord, SyscallContext, SyscallHandler, SyscallTable};
