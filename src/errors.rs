//! Error Types
//!
//! The closed errno taxonomy crossing the syscall boundary, plus the
//! durable-store error wrapper that never crosses it.

use thiserror::Error;

/// Filesystem errors. Every variant maps to exactly one errno value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VfsError {
    #[error("ENOENT: no such file or directory, {operation} '{path}'")]
    NotFound { path: String, operation: String },

    #[error("EEXIST: file already exists, {operation} '{path}'")]
    AlreadyExists { path: String, operation: String },

    #[error("ENOTDIR: not a directory, {operation} '{path}'")]
    NotDirectory { path: String, operation: String },

    #[error("EISDIR: illegal operation on a directory, {operation} '{path}'")]
    IsDirectory { path: String, operation: String },

    #[error("EACCES: permission denied, {operation} '{path}'")]
    AccessDenied { path: String, operation: String },

    #[error("EPERM: operation not permitted, {operation} '{path}'")]
    NotPermitted { path: String, operation: String },

    #[error("EBUSY: resource busy or locked, {operation} '{path}'")]
    Busy { path: String, operation: String },

    #[error("EINVAL: invalid argument, {operation} '{path}'")]
    InvalidArgument { path: String, operation: String },

    #[error("ELOOP: too many levels of symbolic links, {operation} '{path}'")]
    SymlinkLoop { path: String, operation: String },

    #[error("ENOTEMPTY: directory not empty, {operation} '{path}'")]
    NotEmpty { path: String, operation: String },

    #[error("EXDEV: cross-device link not permitted, {operation} '{path}'")]
    CrossDevice { path: String, operation: String },

    #[error("ENODEV: no such device, {operation} '{path}'")]
    NoDevice { path: String, operation: String },

    #[error("EMFILE: too many open files, {operation}")]
    TooManyOpenFiles { operation: String },

    #[error("EBADF: bad file descriptor, {operation}")]
    BadDescriptor { operation: String },

    #[error("ESPIPE: invalid seek, {operation}")]
    IllegalSeek { operation: String },

    #[error("ENOTTY: inappropriate ioctl for device, {operation}")]
    NotTty { operation: String },

    #[error("ENOMEM: not enough memory, {operation}")]
    OutOfMemory { operation: String },

    #[error("EOPNOTSUPP: operation not supported, {operation}")]
    Unsupported { operation: String },

    #[error("EAGAIN: resource temporarily unavailable, {operation}")]
    WouldBlock { operation: String },

    #[error("ECHILD: no child processes, {operation}")]
    NoChildren { operation: String },

    #[error("ENOSYS: function not implemented, {operation}")]
    Unimplemented { operation: String },

    #[error("ERANGE: result too large, {operation}")]
    OutOfRange { operation: String },
}

impl VfsError {
    /// The numeric errno the syscall boundary negates and returns.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound { .. } => libc::ENOENT,
            VfsError::AlreadyExists { .. } => libc::EEXIST,
            VfsError::NotDirectory { .. } => libc::ENOTDIR,
            VfsError::IsDirectory { .. } => libc::EISDIR,
            VfsError::AccessDenied { .. } => libc::EACCES,
            VfsError::NotPermitted { .. } => libc::EPERM,
            VfsError::Busy { .. } => libc::EBUSY,
            VfsError::InvalidArgument { .. } => libc::EINVAL,
            VfsError::SymlinkLoop { .. } => libc::ELOOP,
            VfsError::NotEmpty { .. } => libc::ENOTEMPTY,
            VfsError::CrossDevice { .. } => libc::EXDEV,
            VfsError::NoDevice { .. } => libc::ENODEV,
            VfsError::TooManyOpenFiles { .. } => libc::EMFILE,
            VfsError::BadDescriptor { .. } => libc::EBADF,
            VfsError::IllegalSeek { .. } => libc::ESPIPE,
            VfsError::NotTty { .. } => libc::ENOTTY,
            VfsError::OutOfMemory { .. } => libc::ENOMEM,
            VfsError::Unsupported { .. } => libc::EOPNOTSUPP,
            VfsError::WouldBlock { .. } => libc::EAGAIN,
            VfsError::NoChildren { .. } => libc::ECHILD,
            VfsError::Unimplemented { .. } => libc::ENOSYS,
            VfsError::OutOfRange { .. } => libc::ERANGE,
        }
    }

    pub fn not_found(operation: &str, path: &str) -> Self {
        VfsError::NotFound {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn already_exists(operation: &str, path: &str) -> Self {
        VfsError::AlreadyExists {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn not_directory(operation: &str, path: &str) -> Self {
        VfsError::NotDirectory {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn is_directory(operation: &str, path: &str) -> Self {
        VfsError::IsDirectory {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn access_denied(operation: &str, path: &str) -> Self {
        VfsError::AccessDenied {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn not_permitted(operation: &str, path: &str) -> Self {
        VfsError::NotPermitted {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn busy(operation: &str, path: &str) -> Self {
        VfsError::Busy {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn invalid_argument(operation: &str, path: &str) -> Self {
        VfsError::InvalidArgument {
            path: path.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn bad_descriptor(operation: &str) -> Self {
        VfsError::BadDescriptor {
            operation: operation.to_string(),
        }
    }
}

/// Errors from a durable entry store. These surface through `syncfs`
/// results, never as negated errno values.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store snapshot is not valid: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("store snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("store entry is not valid: {0}")]
    Entry(String),
}

/// Result of a whole-filesystem or per-mount synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] VfsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = VfsError::not_found("open", "/missing/file");
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, open '/missing/file'"
        );

        let err = VfsError::bad_descriptor("read");
        assert_eq!(err.to_string(), "EBADF: bad file descriptor, read");
    }

    #[test]
    fn test_errno_values_match_libc() {
        assert_eq!(VfsError::not_found("stat", "/x").errno(), 2);
        assert_eq!(VfsError::access_denied("open", "/x").errno(), 13);
        assert_eq!(VfsError::invalid_argument("seek", "/x").errno(), 22);
        assert_eq!(
            VfsError::SymlinkLoop {
                path: "/x".to_string(),
                operation: "resolve".to_string()
            }
            .errno(),
            40
        );
    }
}
