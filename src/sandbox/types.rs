use crate::fs::devices::ConsoleSink;
use crate::fs::vfs::TrackingDelegate;
use crate::heap::HeapConfig;

/// Options for creating a Sandbox. Every field has a working default.
#[derive(Default)]
pub struct SandboxOptions {
    /// Initial working directory. Must name a directory that exists in
    /// the bootstrapped tree.
    pub cwd: Option<String>,
    /// Heap layout overrides.
    pub heap: Option<HeapConfig>,
    /// Receives lines written to descriptor 1. Defaults to the host log
    /// at info level.
    pub stdout: Option<ConsoleSink>,
    /// Receives lines written to descriptor 2. Defaults to the host log
    /// at warn level.
    pub stderr: Option<ConsoleSink>,
    /// Enforce rwx permission bits on every access.
    pub check_permissions: bool,
    /// Observer for filesystem activity.
    pub tracking: Option<Box<dyn TrackingDelegate>>,
}

/// Input for writing files.
#[derive(Debug, Clone)]
pub enum FileContent {
    Text(String),
    Bytes(Vec<u8>),
    Encoded { content: String, encoding: FileEncoding },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileEncoding {
    Utf8,
    Base64,
}
