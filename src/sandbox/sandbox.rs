use std::collections::HashMap;

use crate::errors::{SyncError, VfsError};
use crate::fs::devices::ConsoleDevice;
use crate::fs::Vfs;
use crate::heap::LinearMemory;
use crate::syscall::{MmapRecord, SyscallContext, SyscallTable, VarArgs};

use super::types::*;

/// One sandboxed userland: a filesystem tree, a linear memory image and
/// the syscall surface tying them together. Instances are fully
/// independent, so a host process can run several side by side.
pub struct Sandbox {
    vfs: Vfs,
    heap: LinearMemory,
    syscalls: SyscallTable,
    mappings: HashMap<u32, MmapRecord>,
    errno_location: Option<u32>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox").finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a new Sandbox with the given options.
    pub fn create(opts: Option<SandboxOptions>) -> Result<Self, VfsError> {
        let opts = opts.unwrap_or_default();
        let stdout = match opts.stdout {
            Some(sink) => ConsoleDevice::new(sink),
            None => ConsoleDevice::to_log(),
        };
        let stderr = match opts.stderr {
            Some(sink) => ConsoleDevice::new(sink),
            None => ConsoleDevice::to_error_log(),
        };

        let mut vfs = Vfs::new();
        vfs.bootstrap(stdout, stderr)?;
        // Permission enforcement starts only after the default tree is in
        // place, so bootstrap itself never trips over it.
        vfs.check_permissions = opts.check_permissions;
        vfs.set_tracking_delegate(opts.tracking);
        if let Some(cwd) = &opts.cwd {
            vfs.chdir(cwd)?;
        }

        Ok(Sandbox {
            vfs,
            heap: LinearMemory::new(opts.heap.unwrap_or_default()),
            syscalls: SyscallTable::new(),
            mappings: HashMap::new(),
            errno_location: None,
        })
    }

    /// Dispatch one system call. `varargs` is the address of the argument
    /// words the caller staged in linear memory. Returns the call's result,
    /// or a negated errno on failure.
    pub fn syscall(&mut self, id: u32, varargs: u32) -> i32 {
        let mut ctx = SyscallContext {
            vfs: &mut self.vfs,
            heap: &mut self.heap,
            mappings: &mut self.mappings,
            errno_location: self.errno_location,
            args: VarArgs::new(varargs),
        };
        self.syscalls.dispatch(id, &mut ctx)
    }

    /// Install the address of the cell that receives errno codes whenever
    /// a syscall fails.
    pub fn set_errno_location(&mut self, ptr: u32) {
        self.errno_location = Some(ptr);
    }

    /// Flush every mounted filesystem to its persistent store. `populate`
    /// pulls remote state in instead of pushing local state out.
    pub async fn syncfs(&mut self, populate: bool) -> Result<(), SyncError> {
        self.vfs.syncfs(populate).await
    }

    /// Write multiple files to the sandbox filesystem.
    /// Parent directories are created automatically.
    pub fn write_files(&mut self, files: HashMap<String, FileContent>) -> Result<(), VfsError> {
        for (path, content) in files {
            let data = match content {
                FileContent::Text(s) => s.into_bytes(),
                FileContent::Bytes(bytes) => bytes,
                FileContent::Encoded {
                    content: c,
                    encoding,
                } => match encoding {
                    FileEncoding::Base64 => {
                        use base64::Engine;
                        match base64::engine::general_purpose::STANDARD.decode(&c) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                log::debug!("base64 decode failed for {}: {}", path, err);
                                return Err(VfsError::invalid_argument("write", &path));
                            }
                        }
                    }
                    FileEncoding::Utf8 => c.into_bytes(),
                },
            };
            if let Some(last_slash) = path.rfind('/') {
                if last_slash > 0 {
                    self.vfs.mkdir_tree(&path[..last_slash], 511)?;
                }
            }
            self.vfs.write_file_owned(&path, data)?;
        }
        Ok(())
    }

    /// Read a file from the sandbox filesystem. `Base64` returns the raw
    /// bytes encoded for transport; otherwise the contents are taken as
    /// UTF-8.
    pub fn read_file(
        &mut self,
        path: &str,
        encoding: Option<FileEncoding>,
    ) -> Result<String, VfsError> {
        match encoding {
            Some(FileEncoding::Base64) => {
                use base64::Engine;
                let bytes = self.vfs.read_file(path)?;
                Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            _ => self.vfs.read_file_string(path),
        }
    }

    /// Create a directory in the sandbox.
    pub fn mkdir(&mut self, path: &str, recursive: bool) -> Result<(), VfsError> {
        if recursive {
            self.vfs.mkdir_tree(path, 511)
        } else {
            self.vfs.mkdir(path, 511).map(|_| ())
        }
    }

    /// Get current working directory.
    pub fn cwd(&self) -> &str {
        self.vfs.cwd()
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut Vfs {
        &mut self.vfs
    }

    pub fn heap(&self) -> &LinearMemory {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut LinearMemory {
        &mut self.heap
    }
}
