//! Host Backend
//!
//! Mounts a directory of the host filesystem into the sandbox. Nodes are
//! discovered lazily through lookup; file bytes never enter the node
//! table, every read and write goes straight to the host file.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::errors::VfsError;
use crate::fs::mount::MountId;
use crate::fs::node_table::{NodeId, NodePayload, NodeTable};
use crate::fs::streams::{Stream, StreamTable};
use crate::fs::types::{
    self, AttrPatch, FileAttr, NodeCaps, StreamCaps, SEEK_CUR, SEEK_END,
};

/// Open flag bits the host layer understands; the rest are stripped or
/// rejected.
const HOST_FLAG_MASK: u32 = 3 | 64 | 128 | 512 | 1024;
const STRIPPED_FLAGS: u32 = 2097152 | 524288 | 32768 | 2048;

pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HostFs { root: root.into() }
    }

    /// Host path of a node, rebuilt from its parent chain.
    fn real_path(&self, nodes: &NodeTable, mut id: NodeId) -> PathBuf {
        let mut parts = Vec::new();
        loop {
            let node = nodes.node(id);
            if node.is_root() {
                break;
            }
            parts.push(node.name.clone());
            id = node.parent;
        }
        let mut path = self.root.clone();
        for part in parts.iter().rev() {
            path.push(part);
        }
        path
    }

    fn host_mode(path: &Path, op: &str, vfs_path: &str) -> Result<u32, VfsError> {
        let meta = std::fs::symlink_metadata(path)
            .map_err(|err| host_error(err, op, vfs_path))?;
        Ok(meta.mode())
    }

    /// Register a node for a host entry. Every node carries the full
    /// operation set; the host decides what actually works.
    fn create_host_node(
        nodes: &mut NodeTable,
        parent: Option<NodeId>,
        name: &str,
        mode: u32,
        mount: MountId,
        op: &str,
        vfs_path: &str,
    ) -> Result<NodeId, VfsError> {
        let payload = if types::is_dir(mode) {
            NodePayload::Directory {
                children: indexmap::IndexMap::new(),
            }
        } else if types::is_file(mode) {
            NodePayload::File {
                contents: Vec::new(),
                used: 0,
            }
        } else if types::is_link(mode) {
            NodePayload::Symlink {
                target: String::new(),
            }
        } else {
            return Err(VfsError::invalid_argument(op, vfs_path));
        };
        let id = nodes.create(parent, name, mode, 0, mount, payload);
        let node = nodes.node_mut(id);
        node.node_caps = NodeCaps::all();
        node.stream_caps = if types::is_file(mode) {
            StreamCaps::OPEN
                | StreamCaps::CLOSE
                | StreamCaps::READ
                | StreamCaps::WRITE
                | StreamCaps::LLSEEK
        } else {
            StreamCaps::OPEN | StreamCaps::CLOSE | StreamCaps::LLSEEK
        };
        Ok(id)
    }

    fn open_options_for(flags: u32, path: &str) -> Result<OpenOptions, VfsError> {
        let flags = flags & !STRIPPED_FLAGS;
        let mut options = OpenOptions::new();
        match flags & 3 {
            0 => options.read(true),
            1 => options.write(true),
            2 => options.read(true).write(true),
            _ => return Err(VfsError::invalid_argument("open", path)),
        };
        if flags & 64 != 0 {
            options.create(true);
        }
        if flags & 128 != 0 {
            options.create_new(true);
        }
        if flags & 512 != 0 {
            options.truncate(true);
        }
        if flags & 1024 != 0 {
            options.append(true);
        }
        if flags & !HOST_FLAG_MASK != 0 {
            return Err(VfsError::invalid_argument("open", path));
        }
        Ok(options)
    }
}

/// Translate a host I/O error into the sandbox errno taxonomy. The table
/// is closed: a host code with no image in the taxonomy means the bridge
/// itself is broken, not that the program did something wrong.
fn host_error(err: std::io::Error, op: &str, path: &str) -> VfsError {
    let operation = op.to_string();
    let path = path.to_string();
    match err.raw_os_error() {
        Some(libc::ENOENT) => VfsError::NotFound { path, operation },
        Some(libc::EEXIST) => VfsError::AlreadyExists { path, operation },
        Some(libc::ENOTDIR) => VfsError::NotDirectory { path, operation },
        Some(libc::EISDIR) => VfsError::IsDirectory { path, operation },
        Some(libc::EACCES) => VfsError::AccessDenied { path, operation },
        Some(libc::EPERM) => VfsError::NotPermitted { path, operation },
        Some(libc::EBUSY) => VfsError::Busy { path, operation },
        Some(libc::EINVAL) => VfsError::InvalidArgument { path, operation },
        Some(libc::ELOOP) => VfsError::SymlinkLoop { path, operation },
        Some(libc::ENOTEMPTY) => VfsError::NotEmpty { path, operation },
        Some(libc::EXDEV) => VfsError::CrossDevice { path, operation },
        Some(libc::ENODEV) | Some(libc::ENXIO) => VfsError::NoDevice { path, operation },
        Some(libc::EMFILE) | Some(libc::ENFILE) => VfsError::TooManyOpenFiles { operation },
        Some(libc::EBADF) => VfsError::BadDescriptor { operation },
        Some(libc::EROFS) => VfsError::NotPermitted { path, operation },
        _ => panic!(
            "hostfs: no errno mapping for host error during {} '{}': {}",
            operation, path, err
        ),
    }
}

impl Backend for HostFs {
    fn name(&self) -> &'static str {
        "hostfs"
    }

    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError> {
        let root = self.root.clone();
        let mode = Self::host_mode(&root, "mount", &root.to_string_lossy())?;
        Self::create_host_node(nodes, None, "/", mode, mount, "mount", &root.to_string_lossy())
    }

    fn getattr(&self, nodes: &NodeTable, id: NodeId) -> Result<FileAttr, VfsError> {
        let path = self.real_path(nodes, id);
        let meta = std::fs::symlink_metadata(&path)
            .map_err(|err| host_error(err, "stat", &nodes.node(id).name))?;
        Ok(FileAttr {
            dev: meta.dev() as u32,
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            size: meta.size(),
            atime_ms: meta.atime() * 1000 + meta.atime_nsec() / 1_000_000,
            mtime_ms: meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000,
            ctime_ms: meta.ctime() * 1000 + meta.ctime_nsec() / 1_000_000,
            blksize: meta.blksize() as u32,
            blocks: meta.blocks() as u32,
        })
    }

    fn setattr(
        &mut self,
        nodes: &mut NodeTable,
        id: NodeId,
        patch: &AttrPatch,
    ) -> Result<(), VfsError> {
        let path = self.real_path(nodes, id);
        let vfs_name = nodes.node(id).name.clone();
        if let Some(mode) = patch.mode {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 4095))
                .map_err(|err| host_error(err, "chmod", &vfs_name))?;
            nodes.node_mut(id).mode = mode;
        }
        if let Some(timestamp) = patch.timestamp_ms {
            let time = libc::timeval {
                tv_sec: timestamp / 1000,
                tv_usec: (timestamp % 1000) * 1000,
            };
            let times = [time, time];
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| VfsError::invalid_argument("utime", &vfs_name))?;
            let rc = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
            if rc != 0 {
                return Err(host_error(
                    std::io::Error::last_os_error(),
                    "utime",
                    &vfs_name,
                ));
            }
        }
        if let Some(size) = patch.size {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|err| host_error(err, "truncate", &vfs_name))?;
            file.set_len(size)
                .map_err(|err| host_error(err, "truncate", &vfs_name))?;
        }
        Ok(())
    }

    fn lookup(
        &mut self,
        nodes: &mut NodeTable,
        _streams: &StreamTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        let host_path = self.real_path(nodes, parent).join(name);
        let mode = Self::host_mode(&host_path, op, path)?;
        let mount = nodes.node(parent).mount;
        Self::create_host_node(nodes, Some(parent), name, mode, mount, op, path)
    }

    fn mknod(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        mode: u32,
        _rdev: u32,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        let host_path = self.real_path(nodes, parent).join(name);
        if types::is_dir(mode) {
            std::fs::create_dir(&host_path).map_err(|err| host_error(err, op, path))?;
            std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(mode & 4095))
                .map_err(|err| host_error(err, op, path))?;
        } else if types::is_file(mode) {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(mode & 4095)
                .open(&host_path)
                .map_err(|err| host_error(err, op, path))?;
        } else {
            return Err(VfsError::not_permitted(op, path));
        }
        let mount = nodes.node(parent).mount;
        Self::create_host_node(nodes, Some(parent), name, mode, mount, op, path)
    }

    fn rename(
        &mut self,
        nodes: &mut NodeTable,
        old: NodeId,
        new_parent: NodeId,
        new_name: &str,
        op: &str,
        new_path: &str,
    ) -> Result<(), VfsError> {
        let old_path = self.real_path(nodes, old);
        let target = self.real_path(nodes, new_parent).join(new_name);
        std::fs::rename(&old_path, &target).map_err(|err| host_error(err, op, new_path))?;
        let node = nodes.node_mut(old);
        node.name = new_name.to_string();
        node.parent = new_parent;
        Ok(())
    }

    fn unlink(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        let host_path = self.real_path(nodes, parent).join(name);
        std::fs::remove_file(&host_path).map_err(|err| host_error(err, op, path))
    }

    fn rmdir(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        let host_path = self.real_path(nodes, parent).join(name);
        std::fs::remove_dir(&host_path).map_err(|err| host_error(err, op, path))
    }

    fn readdir(&self, nodes: &NodeTable, id: NodeId) -> Result<Vec<String>, VfsError> {
        let path = self.real_path(nodes, id);
        let dir = std::fs::read_dir(&path)
            .map_err(|err| host_error(err, "readdir", &nodes.node(id).name))?;
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|err| host_error(err, "readdir", &nodes.node(id).name))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn symlink(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        target: &str,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        let host_path = self.real_path(nodes, parent).join(name);
        std::os::unix::fs::symlink(target, &host_path)
            .map_err(|err| host_error(err, op, path))?;
        let mode = Self::host_mode(&host_path, op, path)?;
        let mount = nodes.node(parent).mount;
        Self::create_host_node(nodes, Some(parent), name, mode, mount, op, path)
    }

    fn readlink(&self, nodes: &NodeTable, id: NodeId) -> Result<String, VfsError> {
        let path = self.real_path(nodes, id);
        let target = std::fs::read_link(&path)
            .map_err(|err| host_error(err, "readlink", &nodes.node(id).name))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn open(&mut self, nodes: &mut NodeTable, stream: &mut Stream) -> Result<(), VfsError> {
        let node = nodes.node(stream.node);
        if !node.is_file() {
            return Ok(());
        }
        let host_path = self.real_path(nodes, stream.node);
        let options = Self::open_options_for(stream.flags, &stream.path)?;
        let file = options
            .open(&host_path)
            .map_err(|err| host_error(err, "open", &stream.path))?;
        stream.host = Some(file);
        Ok(())
    }

    fn close(&mut self, _nodes: &mut NodeTable, stream: &mut Stream) -> Result<(), VfsError> {
        stream.host.take();
        Ok(())
    }

    fn read(
        &mut self,
        _nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize, VfsError> {
        let file = match &stream.host {
            Some(file) => file,
            None => return Err(VfsError::bad_descriptor("read")),
        };
        loop {
            match file.read_at(buf, position) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(host_error(err, "read", &stream.path)),
            }
        }
    }

    fn write(
        &mut self,
        _nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &[u8],
        position: u64,
        _can_own: bool,
    ) -> Result<usize, VfsError> {
        let file = match &stream.host {
            Some(file) => file,
            None => return Err(VfsError::bad_descriptor("write")),
        };
        loop {
            match file.write_at(buf, position) {
                Ok(written) => return Ok(written),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(host_error(err, "write", &stream.path)),
            }
        }
    }

    fn llseek(
        &mut self,
        nodes: &NodeTable,
        stream: &Stream,
        offset: i64,
        whence: u32,
    ) -> Result<u64, VfsError> {
        let mut position = offset;
        if whence == SEEK_CUR {
            position += stream.position as i64;
        } else if whence == SEEK_END && nodes.node(stream.node).is_file() {
            let file = match &stream.host {
                Some(file) => file,
                None => return Err(VfsError::bad_descriptor("llseek")),
            };
            let meta = file
                .metadata()
                .map_err(|err| host_error(err, "llseek", &stream.path))?;
            position += meta.size() as i64;
        }
        if position < 0 {
            return Err(VfsError::invalid_argument("llseek", &stream.path));
        }
        Ok(position as u64)
    }
}
