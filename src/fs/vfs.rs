//! Filesystem Context
//!
//! The POSIX-like surface of the sandbox: path resolution, mount
//! management, node mutation and descriptor-based stream I/O. All state
//! lives in an explicit `Vfs` value, so one process can hold several
//! independent trees.

use indexmap::IndexMap;

use crate::backend::{Backend, MemFs};
use crate::errors::{SyncError, VfsError};
use crate::fs::devices::{ConsoleDevice, DeviceDriver, DeviceRegistry, NullDevice, RandomDevice};
use crate::fs::mount::{MountId, MountTable};
use crate::fs::node_table::{NodeId, NodePayload, NodeTable};
use crate::fs::streams::{Stream, StreamTable, MAX_OPEN_FDS};
use crate::fs::types::{
    self, AttrPatch, FileAttr, MmapResult, NodeCaps, StreamCaps, PERM_EXEC, PERM_READ, PERM_WRITE,
    SEEK_END, S_IFCHR, S_IFDIR, S_IFLNK, S_IFREG,
};
use crate::heap::memory::LinearMemory;
use crate::path;

/// Nested resolutions (a symlink target that itself walks symlinks)
/// allowed before the resolver reports a loop.
const MAX_RESOLVE_DEPTH: u32 = 8;

/// Consecutive symlink hops allowed while walking a single path.
const MAX_SYMLINK_HOPS: u32 = 40;

/// Descriptor opened with read access.
pub const TRACK_READ: u32 = 1;
/// Descriptor opened with write access.
pub const TRACK_WRITE: u32 = 2;

/// Observer hooks for embedders that harvest filesystem activity around
/// a native invocation. Every hook defaults to a no-op.
pub trait TrackingDelegate: Send {
    fn will_move_path(&mut self, _old_path: &str, _new_path: &str) {}
    fn on_move_path(&mut self, _old_path: &str, _new_path: &str) {}
    fn will_delete_path(&mut self, _path: &str) {}
    fn on_delete_path(&mut self, _path: &str) {}
    fn on_open_file(&mut self, _path: &str, _tracking_flags: u32) {}
    fn on_write_to_file(&mut self, _path: &str) {}
}

/// How `lookup_path` treats the final component.
#[derive(Debug, Clone, Copy)]
pub struct LookupOptions {
    /// Resolve a symlink in the last component instead of returning it.
    pub follow: bool,
    /// Step onto the mounted tree when the last component is a mountpoint.
    pub follow_mount: bool,
    /// Stop at the parent directory of the last component.
    pub parent: bool,
    recurse_count: u32,
}

impl Default for LookupOptions {
    fn default() -> Self {
        LookupOptions {
            follow: false,
            follow_mount: true,
            parent: false,
            recurse_count: 0,
        }
    }
}

/// A resolved path: the canonical absolute form plus the node it names.
#[derive(Debug)]
pub struct Lookup {
    pub path: String,
    pub node: NodeId,
}

/// Non-throwing path probe, for callers that want existence and identity
/// in one shot.
#[derive(Debug, Default)]
pub struct PathInfo {
    pub is_root: bool,
    pub exists: bool,
    /// errno of the failed resolution when `exists` is false.
    pub error: i32,
    pub name: Option<String>,
    pub path: Option<String>,
    pub node: Option<NodeId>,
    pub parent_exists: bool,
    pub parent_path: Option<String>,
    pub parent_node: Option<NodeId>,
}

pub struct Vfs {
    pub nodes: NodeTable,
    pub mounts: MountTable,
    pub streams: StreamTable,
    pub devices: DeviceRegistry,
    root: Option<NodeId>,
    cwd: String,
    /// rwx permission bits are only enforced when set. Defaults to off,
    /// matching a single-user sandbox.
    pub check_permissions: bool,
    sync_requests: usize,
    tracking: Option<Box<dyn TrackingDelegate>>,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            nodes: NodeTable::new(),
            mounts: MountTable::new(),
            streams: StreamTable::new(),
            devices: DeviceRegistry::new(),
            root: None,
            cwd: "/".to_string(),
            check_permissions: false,
            sync_requests: 0,
            tracking: None,
        }
    }

    /// Mount the default in-memory tree and populate the standard
    /// directories, device nodes and descriptors 0, 1 and 2.
    pub fn bootstrap(&mut self, stdout: ConsoleDevice, stderr: ConsoleDevice) -> Result<(), VfsError> {
        self.mount(Box::new(MemFs), "/")?;
        self.create_default_directories()?;
        self.create_default_devices(stdout, stderr)?;
        self.create_special_directories()?;
        self.create_standard_streams()
    }

    pub fn set_tracking_delegate(&mut self, delegate: Option<Box<dyn TrackingDelegate>>) {
        self.tracking = delegate;
    }

    fn root(&self) -> NodeId {
        match self.root {
            Some(root) => root,
            None => panic!("filesystem has no root mount"),
        }
    }

    // ------------------------------------------------------------------
    // resolution

    /// Walk `path` from the root (or cwd for relative paths), crossing
    /// mountpoints and symlinks according to `opts`.
    fn lookup_path(&mut self, op: &str, path: &str, opts: LookupOptions) -> Result<Lookup, VfsError> {
        let path = path::resolve(&self.cwd, path);
        if path.is_empty() {
            return Err(VfsError::not_found(op, &path));
        }
        if opts.recurse_count > MAX_RESOLVE_DEPTH {
            return Err(VfsError::SymlinkLoop {
                path,
                operation: op.to_string(),
            });
        }

        let parts = path::normalize_parts(path.split('/').filter(|p| !p.is_empty()).collect(), false);
        let mut current = self.root();
        let mut current_path = "/".to_string();

        for (i, part) in parts.iter().enumerate() {
            let islast = i == parts.len() - 1;
            if islast && opts.parent {
                break;
            }

            current = self.lookup_node(current, part, op, &path)?;
            current_path = path::join2(&current_path, part);

            // step onto the mounted tree covering this directory
            if let Some(mounted) = self.nodes.node(current).mounted {
                if !islast || opts.follow_mount {
                    current = self.mounts.get(mounted).root;
                }
            }

            if !islast || opts.follow {
                let mut hops = 0;
                while self.nodes.node(current).is_link() {
                    let link = self.readlink_with_op(op, &current_path)?;
                    current_path = path::resolve(&path::dirname(&current_path), &link);
                    let lookup = self.lookup_path(
                        op,
                        &current_path,
                        LookupOptions {
                            recurse_count: opts.recurse_count + 1,
                            ..Default::default()
                        },
                    )?;
                    current = lookup.node;
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(VfsError::SymlinkLoop {
                            path,
                            operation: op.to_string(),
                        });
                    }
                }
            }
        }

        Ok(Lookup {
            path: current_path,
            node: current,
        })
    }

    /// Find `name` under `parent`, consulting the hash index first and the
    /// backend for entries realized lazily.
    pub(crate) fn lookup_node(&mut self, parent: NodeId, name: &str, op: &str, path: &str) -> Result<NodeId, VfsError> {
        self.may_lookup(parent, op, path)?;
        if let Some(found) = self.nodes.probe(parent, name) {
            return Ok(found);
        }
        let mount = self.nodes.node(parent).mount;
        self.mounts
            .backend_mut(mount)
            .lookup(&mut self.nodes, &self.streams, parent, name, op, path)
    }

    /// Reconstruct the canonical absolute path of a node by walking parent
    /// links up to its mount.
    pub fn get_path(&self, node: NodeId) -> String {
        let mut tail: Option<String> = None;
        let mut current = node;
        loop {
            let n = self.nodes.node(current);
            if n.is_root() {
                let mountpoint = &self.mounts.get(n.mount).mountpoint;
                return match tail {
                    None => mountpoint.clone(),
                    Some(tail) if mountpoint.ends_with('/') => format!("{}{}", mountpoint, tail),
                    Some(tail) => format!("{}/{}", mountpoint, tail),
                };
            }
            tail = Some(match tail {
                None => n.name.clone(),
                Some(tail) => format!("{}/{}", n.name, tail),
            });
            current = n.parent;
        }
    }

    // ------------------------------------------------------------------
    // permission gates

    fn node_permissions(&self, node: NodeId, perms: u8, op: &str, path: &str) -> Result<(), VfsError> {
        if !self.check_permissions {
            return Ok(());
        }
        let mode = self.nodes.node(node).mode;
        if perms & PERM_READ != 0 && mode & 292 == 0 {
            return Err(VfsError::access_denied(op, path));
        }
        if perms & PERM_WRITE != 0 && mode & 146 == 0 {
            return Err(VfsError::access_denied(op, path));
        }
        if perms & PERM_EXEC != 0 && mode & 73 == 0 {
            return Err(VfsError::access_denied(op, path));
        }
        Ok(())
    }

    fn may_lookup(&self, dir: NodeId, op: &str, path: &str) -> Result<(), VfsError> {
        self.node_permissions(dir, PERM_EXEC, op, path)?;
        if !self.nodes.node(dir).node_caps.contains(NodeCaps::LOOKUP) {
            return Err(VfsError::access_denied(op, path));
        }
        Ok(())
    }

    fn may_create(&mut self, dir: NodeId, name: &str, op: &str, path: &str) -> Result<(), VfsError> {
        if self.lookup_node(dir, name, op, path).is_ok() {
            return Err(VfsError::already_exists(op, path));
        }
        self.node_permissions(dir, PERM_WRITE | PERM_EXEC, op, path)
    }

    fn may_delete(&mut self, dir: NodeId, name: &str, isdir: bool, op: &str, path: &str) -> Result<NodeId, VfsError> {
        let node = self.lookup_node(dir, name, op, path)?;
        self.node_permissions(dir, PERM_WRITE | PERM_EXEC, op, path)?;
        if isdir {
            if !self.nodes.node(node).is_dir() {
                return Err(VfsError::not_directory(op, path));
            }
            if self.nodes.node(node).is_root() || self.get_path(node) == self.cwd {
                return Err(VfsError::busy(op, path));
            }
        } else if self.nodes.node(node).is_dir() {
            return Err(VfsError::is_directory(op, path));
        }
        Ok(node)
    }

    fn may_open(&self, node: NodeId, flags: u32, op: &str, path: &str) -> Result<(), VfsError> {
        let n = self.nodes.node(node);
        if n.is_link() {
            return Err(VfsError::SymlinkLoop {
                path: path.to_string(),
                operation: op.to_string(),
            });
        }
        let perms = types::flags_to_perms(flags);
        if n.is_dir() && perms != PERM_READ {
            return Err(VfsError::is_directory(op, path));
        }
        self.node_permissions(node, perms, op, path)
    }

    // ------------------------------------------------------------------
    // mounts

    /// Attach a backend at `mountpoint` and return its root node. The
    /// first mount must target "/".
    pub fn mount(&mut self, backend: Box<dyn Backend>, mountpoint: &str) -> Result<NodeId, VfsError> {
        let op = "mount";
        let is_root = mountpoint == "/";
        if is_root && self.root.is_some() {
            return Err(VfsError::busy(op, mountpoint));
        }

        let (mountpoint, covered, parent) = if is_root {
            (mountpoint.to_string(), None, None)
        } else {
            let lookup = self.lookup_path(op, mountpoint, LookupOptions {
                follow_mount: false,
                ..Default::default()
            })?;
            let node = lookup.node;
            if self.nodes.node(node).mounted.is_some() {
                return Err(VfsError::busy(op, &lookup.path));
            }
            if !self.nodes.node(node).is_dir() {
                return Err(VfsError::not_directory(op, &lookup.path));
            }
            let parent = self.nodes.node(node).mount;
            (lookup.path, Some(node), Some(parent))
        };

        let mut backend = backend;
        let name = backend.name();
        let id = self.mounts.next_id();
        let root = backend.mount(&mut self.nodes, id)?;
        let id = self.mounts.add(backend, mountpoint.clone(), root, parent);
        if is_root {
            self.root = Some(root);
        } else if let Some(covered) = covered {
            self.nodes.node_mut(covered).mounted = Some(id);
        }
        log::debug!("mounted {} at '{}'", name, mountpoint);
        Ok(root)
    }

    /// Detach the mount covering `mountpoint` along with every mount
    /// nested below it.
    pub fn unmount(&mut self, mountpoint: &str) -> Result<(), VfsError> {
        let op = "unmount";
        let lookup = self.lookup_path(op, mountpoint, LookupOptions {
            follow_mount: false,
            ..Default::default()
        })?;
        let node = lookup.node;
        let mounted = match self.nodes.node(node).mounted {
            Some(mounted) => mounted,
            None => return Err(VfsError::invalid_argument(op, &lookup.path)),
        };
        let detached = self.mounts.subtree(mounted);
        self.nodes.purge_mounts(&detached);
        self.nodes.node_mut(node).mounted = None;
        self.mounts.detach(mounted);
        log::debug!("unmounted '{}'", lookup.path);
        Ok(())
    }

    /// Reconcile every mount with its durable store. `populate` pulls the
    /// store into memory, otherwise memory is pushed out. The first error
    /// wins; remaining mounts are still visited.
    pub async fn syncfs(&mut self, populate: bool) -> Result<(), SyncError> {
        self.sync_requests += 1;
        if self.sync_requests > 1 {
            log::warn!(
                "{} filesystem sync operations in flight at once, probably just doing extra work",
                self.sync_requests
            );
        }
        let root_mount = self.nodes.node(self.root()).mount;
        let mounts = self.mounts.subtree(root_mount);
        let mut first_error: Option<SyncError> = None;
        for id in mounts {
            let (mountpoint, root) = {
                let mount = self.mounts.get(id);
                (mount.mountpoint.clone(), mount.root)
            };
            let result = self
                .mounts
                .backend_mut(id)
                .syncfs(&mut self.nodes, &mountpoint, root, populate)
                .await;
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        self.sync_requests -= 1;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // node operations

    pub fn mknod(&mut self, path: &str, mode: u32, dev: u32) -> Result<NodeId, VfsError> {
        self.mknod_with_op("mknod", path, mode, dev)
    }

    fn mknod_with_op(&mut self, op: &str, path: &str, mode: u32, dev: u32) -> Result<NodeId, VfsError> {
        let lookup = self.lookup_path(op, path, LookupOptions {
            parent: true,
            ..Default::default()
        })?;
        let parent = lookup.node;
        let name = path::basename(path);
        if name.is_empty() || name == "." || name == ".." || name == "/" {
            return Err(VfsError::invalid_argument(op, path));
        }
        self.may_create(parent, &name, op, path)?;
        if !self.nodes.node(parent).node_caps.contains(NodeCaps::MKNOD) {
            return Err(VfsError::not_permitted(op, path));
        }
        let mount = self.nodes.node(parent).mount;
        self.mounts
            .backend_mut(mount)
            .mknod(&mut self.nodes, parent, &name, mode, dev, op, path)
    }

    pub fn create(&mut self, path: &str, mode: u32) -> Result<NodeId, VfsError> {
        let mode = (mode & types::MODE_PERM_MASK) | S_IFREG;
        self.mknod_with_op("create", path, mode, 0)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<NodeId, VfsError> {
        let mode = (mode & 1023) | S_IFDIR;
        self.mknod_with_op("mkdir", path, mode, 0)
    }

    /// Create every missing directory along `path`, ignoring the ones that
    /// already exist.
    pub fn mkdir_tree(&mut self, path: &str, mode: u32) -> Result<(), VfsError> {
        let mut built = String::new();
        for part in path.split('/') {
            if part.is_empty() {
                continue;
            }
            built.push('/');
            built.push_str(part);
            match self.mkdir(&built, mode) {
                Ok(_) => {}
                Err(VfsError::AlreadyExists { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn mkdev(&mut self, path: &str, mode: u32, dev: u32) -> Result<NodeId, VfsError> {
        self.mknod_with_op("mkdev", path, mode | S_IFCHR, dev)
    }

    pub fn register_device(&mut self, dev: u32, driver: Box<dyn DeviceDriver>) {
        self.devices.register(dev, driver);
    }

    pub fn symlink(&mut self, target: &str, newpath: &str) -> Result<NodeId, VfsError> {
        let op = "symlink";
        if path::resolve(&self.cwd, target).is_empty() {
            return Err(VfsError::not_found(op, target));
        }
        let lookup = self.lookup_path(op, newpath, LookupOptions {
            parent: true,
            ..Default::default()
        })?;
        let parent = lookup.node;
        let name = path::basename(newpath);
        self.may_create(parent, &name, op, newpath)?;
        if !self.nodes.node(parent).node_caps.contains(NodeCaps::SYMLINK) {
            return Err(VfsError::not_permitted(op, newpath));
        }
        let mount = self.nodes.node(parent).mount;
        self.mounts
            .backend_mut(mount)
            .symlink(&mut self.nodes, parent, &name, target, op, newpath)
    }

    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), VfsError> {
        let op = "rename";
        let old_dirname = path::dirname(old_path);
        let new_dirname = path::dirname(new_path);
        let old_name = path::basename(old_path);
        let new_name = path::basename(new_path);

        let old_lookup = self.lookup_path(op, old_path, LookupOptions {
            parent: true,
            ..Default::default()
        });
        let new_lookup = self.lookup_path(op, new_path, LookupOptions {
            parent: true,
            ..Default::default()
        });
        let (old_dir, new_dir) = match (old_lookup, new_lookup) {
            (Ok(old), Ok(new)) => (old.node, new.node),
            _ => return Err(VfsError::busy(op, old_path)),
        };

        if self.nodes.node(old_dir).mount != self.nodes.node(new_dir).mount {
            return Err(VfsError::CrossDevice {
                path: new_path.to_string(),
                operation: op.to_string(),
            });
        }

        let old_node = self.lookup_node(old_dir, &old_name, op, old_path)?;

        // a directory cannot move into itself, and the target cannot
        // contain the source's parent
        let resolved_old = path::resolve(&self.cwd, old_path);
        let resolved_new = path::resolve(&self.cwd, new_path);
        let relative = path::relative(&resolved_old, &path::resolve(&self.cwd, &new_dirname));
        if !relative.starts_with('.') {
            return Err(VfsError::invalid_argument(op, old_path));
        }
        let relative = path::relative(&resolved_new, &path::resolve(&self.cwd, &old_dirname));
        if !relative.starts_with('.') {
            return Err(VfsError::NotEmpty {
                path: new_path.to_string(),
                operation: op.to_string(),
            });
        }

        let new_node = self.lookup_node(new_dir, &new_name, op, new_path).ok();
        if new_node == Some(old_node) {
            return Ok(());
        }

        let isdir = self.nodes.node(old_node).is_dir();
        self.may_delete(old_dir, &old_name, isdir, op, old_path)?;
        match new_node {
            Some(_) => {
                self.may_delete(new_dir, &new_name, isdir, op, new_path)?;
            }
            None => self.may_create(new_dir, &new_name, op, new_path)?,
        }
        if !self.nodes.node(old_dir).node_caps.contains(NodeCaps::RENAME) {
            return Err(VfsError::not_permitted(op, old_path));
        }
        if self.nodes.node(old_node).mounted.is_some()
            || new_node.is_some_and(|n| self.nodes.node(n).mounted.is_some())
        {
            return Err(VfsError::busy(op, old_path));
        }
        if new_dir != old_dir {
            self.node_permissions(old_dir, PERM_WRITE, op, old_path)?;
        }

        if let Some(tracking) = self.tracking.as_mut() {
            tracking.will_move_path(old_path, new_path);
        }
        // the node changes identity in the hash index, so unhook it for
        // the duration of the backend call and re-add whatever happened
        self.nodes.hash_remove(old_node);
        let mount = self.nodes.node(old_dir).mount;
        let result = self
            .mounts
            .backend_mut(mount)
            .rename(&mut self.nodes, old_node, new_dir, &new_name, op, new_path);
        self.nodes.hash_add(old_node);
        result?;
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.on_move_path(old_path, new_path);
        }
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), VfsError> {
        let op = "rmdir";
        let lookup = self.lookup_path(op, path, LookupOptions {
            parent: true,
            ..Default::default()
        })?;
        let parent = lookup.node;
        let name = path::basename(path);
        let node = self.may_delete(parent, &name, true, op, path)?;
        if !self.nodes.node(parent).node_caps.contains(NodeCaps::RMDIR) {
            return Err(VfsError::not_permitted(op, path));
        }
        if self.nodes.node(node).mounted.is_some() {
            return Err(VfsError::busy(op, path));
        }
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.will_delete_path(path);
        }
        let mount = self.nodes.node(parent).mount;
        self.mounts
            .backend_mut(mount)
            .rmdir(&mut self.nodes, parent, &name, op, path)?;
        self.nodes.destroy(node);
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.on_delete_path(path);
        }
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), VfsError> {
        let op = "unlink";
        let lookup = self.lookup_path(op, path, LookupOptions {
            parent: true,
            ..Default::default()
        })?;
        let parent = lookup.node;
        let name = path::basename(path);
        let node = self.may_delete(parent, &name, false, op, path)?;
        if !self.nodes.node(parent).node_caps.contains(NodeCaps::UNLINK) {
            return Err(VfsError::not_permitted(op, path));
        }
        if self.nodes.node(node).mounted.is_some() {
            return Err(VfsError::busy(op, path));
        }
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.will_delete_path(path);
        }
        let mount = self.nodes.node(parent).mount;
        self.mounts
            .backend_mut(mount)
            .unlink(&mut self.nodes, parent, &name, op, path)?;
        self.nodes.destroy(node);
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.on_delete_path(path);
        }
        Ok(())
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<String>, VfsError> {
        let op = "readdir";
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        let node = lookup.node;
        if !self.nodes.node(node).node_caps.contains(NodeCaps::READDIR) {
            return Err(VfsError::not_directory(op, path));
        }
        let mount = self.nodes.node(node).mount;
        self.mounts.backend(mount).readdir(&self.nodes, node)
    }

    /// Read a symlink's target, resolved to an absolute path.
    pub fn readlink(&mut self, path: &str) -> Result<String, VfsError> {
        self.readlink_with_op("readlink", path)
    }

    fn readlink_with_op(&mut self, op: &str, path: &str) -> Result<String, VfsError> {
        let lookup = self.lookup_path(op, path, LookupOptions::default())?;
        let node = lookup.node;
        if !self.nodes.node(node).node_caps.contains(NodeCaps::READLINK) {
            return Err(VfsError::invalid_argument(op, path));
        }
        let mount = self.nodes.node(node).mount;
        let target = self.mounts.backend(mount).readlink(&self.nodes, node)?;
        let parent = self.nodes.node(node).parent;
        Ok(path::resolve(&self.get_path(parent), &target))
    }

    pub fn stat(&mut self, path: &str) -> Result<FileAttr, VfsError> {
        self.stat_with("stat", path, true)
    }

    pub fn lstat(&mut self, path: &str) -> Result<FileAttr, VfsError> {
        self.stat_with("lstat", path, false)
    }

    fn stat_with(&mut self, op: &str, path: &str, follow: bool) -> Result<FileAttr, VfsError> {
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow,
            ..Default::default()
        })?;
        let node = lookup.node;
        if !self.nodes.node(node).node_caps.contains(NodeCaps::GETATTR) {
            return Err(VfsError::not_permitted(op, path));
        }
        let mount = self.nodes.node(node).mount;
        self.mounts.backend(mount).getattr(&self.nodes, node)
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<(), VfsError> {
        let op = "chmod";
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        self.chmod_node(lookup.node, mode, op, path)
    }

    pub fn lchmod(&mut self, path: &str, mode: u32) -> Result<(), VfsError> {
        let op = "lchmod";
        let lookup = self.lookup_path(op, path, LookupOptions::default())?;
        self.chmod_node(lookup.node, mode, op, path)
    }

    pub fn fchmod(&mut self, fd: usize, mode: u32) -> Result<(), VfsError> {
        let op = "fchmod";
        let (node, spath) = match self.streams.get(fd) {
            Some(stream) => (stream.node, stream.path.clone()),
            None => return Err(VfsError::bad_descriptor(op)),
        };
        self.chmod_node(node, mode, op, &spath)
    }

    fn chmod_node(&mut self, node: NodeId, mode: u32, op: &str, path: &str) -> Result<(), VfsError> {
        if !self.nodes.node(node).node_caps.contains(NodeCaps::SETATTR) {
            return Err(VfsError::not_permitted(op, path));
        }
        let current = self.nodes.node(node).mode;
        let mount = self.nodes.node(node).mount;
        self.mounts.backend_mut(mount).setattr(
            &mut self.nodes,
            node,
            &AttrPatch {
                mode: Some((mode & types::MODE_PERM_MASK) | (current & !types::MODE_PERM_MASK)),
                timestamp_ms: Some(types::now_ms()),
                ..Default::default()
            },
        )
    }

    pub fn truncate(&mut self, path: &str, len: i64) -> Result<(), VfsError> {
        let op = "truncate";
        if len < 0 {
            return Err(VfsError::invalid_argument(op, path));
        }
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        self.truncate_node(lookup.node, len as u64, op, path)
    }

    pub fn ftruncate(&mut self, fd: usize, len: i64) -> Result<(), VfsError> {
        let op = "ftruncate";
        let (node, spath, readonly) = match self.streams.get(fd) {
            Some(stream) => (stream.node, stream.path.clone(), !stream.is_write()),
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if readonly {
            return Err(VfsError::invalid_argument(op, &spath));
        }
        if len < 0 {
            return Err(VfsError::invalid_argument(op, &spath));
        }
        self.truncate_node(node, len as u64, op, &spath)
    }

    fn truncate_node(&mut self, node: NodeId, len: u64, op: &str, path: &str) -> Result<(), VfsError> {
        let n = self.nodes.node(node);
        if !n.node_caps.contains(NodeCaps::SETATTR) {
            return Err(VfsError::not_permitted(op, path));
        }
        if n.is_dir() {
            return Err(VfsError::is_directory(op, path));
        }
        if !n.is_file() {
            return Err(VfsError::invalid_argument(op, path));
        }
        self.node_permissions(node, PERM_WRITE, op, path)?;
        let mount = self.nodes.node(node).mount;
        self.mounts.backend_mut(mount).setattr(
            &mut self.nodes,
            node,
            &AttrPatch {
                size: Some(len),
                timestamp_ms: Some(types::now_ms()),
                ..Default::default()
            },
        )
    }

    /// Stamp a node with the later of the two classic utime arguments.
    pub fn utime(&mut self, path: &str, atime_ms: i64, mtime_ms: i64) -> Result<(), VfsError> {
        let op = "utime";
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        let node = lookup.node;
        if !self.nodes.node(node).node_caps.contains(NodeCaps::SETATTR) {
            return Err(VfsError::not_permitted(op, path));
        }
        let mount = self.nodes.node(node).mount;
        self.mounts.backend_mut(mount).setattr(
            &mut self.nodes,
            node,
            &AttrPatch {
                timestamp_ms: Some(atime_ms.max(mtime_ms)),
                ..Default::default()
            },
        )
    }

    // ------------------------------------------------------------------
    // streams

    pub fn open(&mut self, path: &str, flags: u32, mode: u32) -> Result<usize, VfsError> {
        self.open_at(path, flags, mode, 0)
    }

    /// Open with one of the fixed stdio mode strings ("r", "w", "a+", ...).
    pub fn open_mode(&mut self, path: &str, mode_str: &str) -> Result<usize, VfsError> {
        self.open_at(path, types::mode_string_to_flags(mode_str), 438, 0)
    }

    /// Open allocating the lowest free descriptor at or above `fd_start`.
    pub fn open_at(&mut self, path: &str, flags: u32, mode: u32, fd_start: usize) -> Result<usize, VfsError> {
        let op = "open";
        if path.is_empty() {
            return Err(VfsError::not_found(op, path));
        }
        let mut flags = flags;
        let mode = if flags & types::O_CREAT != 0 {
            (mode & types::MODE_PERM_MASK) | S_IFREG
        } else {
            0
        };
        let mut path = path::normalize(path);

        let mut node = None;
        if let Ok(lookup) = self.lookup_path(op, &path, LookupOptions {
            follow: flags & types::O_NOFOLLOW == 0,
            ..Default::default()
        }) {
            node = Some(lookup.node);
            path = lookup.path;
        }

        let mut created = false;
        let node = if flags & types::O_CREAT != 0 {
            match node {
                Some(node) => {
                    if flags & types::O_EXCL != 0 {
                        return Err(VfsError::already_exists(op, &path));
                    }
                    node
                }
                None => {
                    let node = self.mknod_with_op(op, &path, mode, 0)?;
                    created = true;
                    node
                }
            }
        } else {
            match node {
                Some(node) => node,
                None => return Err(VfsError::not_found(op, &path)),
            }
        };

        // character devices never truncate
        if self.nodes.node(node).is_chrdev() {
            flags &= !types::O_TRUNC;
        }
        if flags & types::O_DIRECTORY != 0 && !self.nodes.node(node).is_dir() {
            return Err(VfsError::not_directory(op, &path));
        }
        if !created {
            self.may_open(node, flags, op, &path)?;
        }
        if flags & types::O_TRUNC != 0 {
            self.truncate_node(node, 0, op, &path)?;
        }
        // creation and truncation must not repeat through this descriptor
        flags &= !(types::O_EXCL | types::O_TRUNC);

        let stream_path = self.get_path(node);
        let caps = self.nodes.node(node).stream_caps;
        let mut stream = Stream::new(node, stream_path, flags, caps);
        if self.nodes.node(node).is_chrdev() {
            let rdev = self.nodes.node(node).rdev;
            let driver = match self.devices.get_mut(rdev) {
                Some(driver) => driver,
                None => {
                    return Err(VfsError::NoDevice {
                        path: path.clone(),
                        operation: op.to_string(),
                    })
                }
            };
            stream.caps = driver.stream_caps();
            stream.seekable = stream.caps.contains(StreamCaps::LLSEEK);
            stream.device = Some(rdev);
            driver.open(&mut stream)?;
        } else if stream.caps.contains(StreamCaps::OPEN) {
            let mount = self.nodes.node(node).mount;
            self.mounts.backend_mut(mount).open(&mut self.nodes, &mut stream)?;
        }
        let fd = self.streams.alloc(stream, fd_start)?;

        if let Some(tracking) = self.tracking.as_mut() {
            let mut tracking_flags = 0;
            if types::stream_is_read(flags) {
                tracking_flags |= TRACK_READ;
            }
            if types::stream_is_write(flags) {
                tracking_flags |= TRACK_WRITE;
            }
            tracking.on_open_file(&path, tracking_flags);
        }
        Ok(fd)
    }

    /// Close a descriptor. The slot is freed even when the close hook
    /// reports an error.
    pub fn close(&mut self, fd: usize) -> Result<(), VfsError> {
        let mut stream = match self.streams.take(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor("close")),
        };
        stream.getdents = None;
        match stream.device {
            Some(dev) => {
                if let Some(driver) = self.devices.get_mut(dev) {
                    driver.fsync();
                }
                Ok(())
            }
            None if stream.caps.contains(StreamCaps::CLOSE) => {
                let mount = self.nodes.node(stream.node).mount;
                self.mounts.backend_mut(mount).close(&mut self.nodes, &mut stream)
            }
            None => Ok(()),
        }
    }

    pub fn close_all(&mut self) -> Result<(), VfsError> {
        for fd in 0..=MAX_OPEN_FDS {
            if self.streams.is_open(fd) {
                self.close(fd)?;
            }
        }
        Ok(())
    }

    pub fn llseek(&mut self, fd: usize, offset: i64, whence: u32) -> Result<u64, VfsError> {
        let op = "llseek";
        let stream = match self.streams.get_mut(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if !stream.seekable || !stream.caps.contains(StreamCaps::LLSEEK) {
            return Err(VfsError::IllegalSeek {
                operation: op.to_string(),
            });
        }
        let mount = self.nodes.node(stream.node).mount;
        let position = self
            .mounts
            .backend_mut(mount)
            .llseek(&self.nodes, stream, offset, whence)?;
        stream.position = position;
        stream.ungotten.clear();
        Ok(position)
    }

    /// Read into `buf`, at `position` if given without moving the cursor,
    /// at the cursor otherwise.
    pub fn read(&mut self, fd: usize, buf: &mut [u8], position: Option<u64>) -> Result<usize, VfsError> {
        let op = "read";
        let stream = match self.streams.get_mut(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if !stream.is_read() {
            return Err(VfsError::bad_descriptor(op));
        }
        if self.nodes.node(stream.node).is_dir() {
            return Err(VfsError::is_directory(op, &stream.path));
        }
        if !stream.caps.contains(StreamCaps::READ) {
            return Err(VfsError::invalid_argument(op, &stream.path));
        }
        if position.is_some() && !stream.seekable {
            return Err(VfsError::IllegalSeek {
                operation: op.to_string(),
            });
        }
        let read = match stream.device {
            Some(dev) => {
                let driver = match self.devices.get_mut(dev) {
                    Some(driver) => driver,
                    None => panic!("no driver registered for device {}", dev),
                };
                driver.read(stream, buf)?
            }
            None => {
                let mount = self.nodes.node(stream.node).mount;
                let pos = position.unwrap_or(stream.position);
                self.mounts
                    .backend_mut(mount)
                    .read(&mut self.nodes, stream, buf, pos)?
            }
        };
        if position.is_none() {
            stream.position += read as u64;
        }
        Ok(read)
    }

    /// Write `buf`, honoring append mode and the positional variant. When
    /// `can_own` is set the backend may adopt the bytes as the new file
    /// content outright.
    pub fn write(&mut self, fd: usize, buf: &[u8], position: Option<u64>, can_own: bool) -> Result<usize, VfsError> {
        let op = "write";
        let append = {
            let stream = match self.streams.get(fd) {
                Some(stream) => stream,
                None => return Err(VfsError::bad_descriptor(op)),
            };
            if !stream.is_write() {
                return Err(VfsError::bad_descriptor(op));
            }
            if self.nodes.node(stream.node).is_dir() {
                return Err(VfsError::is_directory(op, &stream.path));
            }
            if !stream.caps.contains(StreamCaps::WRITE) {
                return Err(VfsError::invalid_argument(op, &stream.path));
            }
            stream.is_append()
        };
        if append {
            self.llseek(fd, 0, SEEK_END)?;
        }
        let stream = match self.streams.get_mut(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if position.is_some() && !stream.seekable {
            return Err(VfsError::IllegalSeek {
                operation: op.to_string(),
            });
        }
        let written = match stream.device {
            Some(dev) => {
                let driver = match self.devices.get_mut(dev) {
                    Some(driver) => driver,
                    None => panic!("no driver registered for device {}", dev),
                };
                driver.write(stream, buf)?
            }
            None => {
                let mount = self.nodes.node(stream.node).mount;
                let pos = position.unwrap_or(stream.position);
                self.mounts
                    .backend_mut(mount)
                    .write(&mut self.nodes, stream, buf, pos, can_own)?
            }
        };
        if position.is_none() {
            stream.position += written as u64;
        }
        let spath = stream.path.clone();
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.on_write_to_file(&spath);
        }
        Ok(written)
    }

    /// Reserve storage for a file region.
    pub fn allocate(&mut self, fd: usize, offset: i64, length: i64) -> Result<(), VfsError> {
        let op = "allocate";
        let stream = match self.streams.get(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if offset < 0 || length <= 0 {
            return Err(VfsError::invalid_argument(op, &stream.path));
        }
        if !stream.is_write() {
            return Err(VfsError::bad_descriptor(op));
        }
        let node = self.nodes.node(stream.node);
        if !node.is_file() && !node.is_dir() {
            return Err(VfsError::NoDevice {
                path: stream.path.clone(),
                operation: op.to_string(),
            });
        }
        if !stream.caps.contains(StreamCaps::ALLOCATE) {
            return Err(VfsError::Unsupported {
                operation: op.to_string(),
            });
        }
        let mount = node.mount;
        self.mounts
            .backend_mut(mount)
            .allocate(&mut self.nodes, stream, offset as u64, length as u64)
    }

    /// Map a file region into the linear heap.
    pub fn mmap(
        &mut self,
        fd: usize,
        heap: &mut LinearMemory,
        length: usize,
        prot: u32,
        flags: u32,
        position: u64,
    ) -> Result<MmapResult, VfsError> {
        let op = "mmap";
        let stream = match self.streams.get(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        if !stream.is_read() {
            return Err(VfsError::access_denied(op, &stream.path));
        }
        if !stream.caps.contains(StreamCaps::MMAP) {
            return Err(VfsError::NoDevice {
                path: stream.path.clone(),
                operation: op.to_string(),
            });
        }
        let mount = self.nodes.node(stream.node).mount;
        self.mounts
            .backend_mut(mount)
            .mmap(&mut self.nodes, heap, stream, length, prot, flags, position)
    }

    /// Write a mapped view back to the file. Streams without msync
    /// support absorb the call silently.
    pub fn msync(&mut self, fd: usize, buf: &[u8], offset: u64, mmap_flags: u32) -> Result<(), VfsError> {
        let stream = match self.streams.get_mut(fd) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        if !stream.caps.contains(StreamCaps::MSYNC) {
            return Ok(());
        }
        let mount = self.nodes.node(stream.node).mount;
        self.mounts
            .backend_mut(mount)
            .msync(&mut self.nodes, stream, buf, offset, mmap_flags)
    }

    pub fn ioctl(&mut self, fd: usize, _request: u32) -> Result<i32, VfsError> {
        let op = "ioctl";
        if self.streams.get(fd).is_none() {
            return Err(VfsError::bad_descriptor(op));
        }
        // no stream surface registers an ioctl handler; the fixed tty
        // command set is answered at the syscall layer before this runs
        Err(VfsError::NotTty {
            operation: op.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // convenience

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, VfsError> {
        let fd = self.open_mode(path, "r")?;
        let attr = self.stat(path)?;
        let mut buf = vec![0u8; attr.size as usize];
        self.read(fd, &mut buf, Some(0))?;
        self.close(fd)?;
        Ok(buf)
    }

    pub fn read_file_string(&mut self, path: &str) -> Result<String, VfsError> {
        let bytes = self.read_file(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        let fd = self.open_mode(path, "w")?;
        self.write(fd, data, None, false)?;
        self.close(fd)
    }

    /// Like `write_file`, but hands the buffer to the backend so the file
    /// ends up holding it at exact size.
    pub fn write_file_owned(&mut self, path: &str, data: Vec<u8>) -> Result<(), VfsError> {
        let fd = self.open_mode(path, "w")?;
        self.write(fd, &data, None, true)?;
        self.close(fd)
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Check real permissions on a path, classic `access(2)` shape: bit 4
    /// read, bit 2 write, bit 1 execute, zero for bare existence.
    pub fn access(&mut self, path: &str, amode: u32) -> Result<(), VfsError> {
        let op = "access";
        if amode & !7 != 0 {
            return Err(VfsError::invalid_argument(op, path));
        }
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        let mut perms = 0u8;
        if amode & 4 != 0 {
            perms |= PERM_READ;
        }
        if amode & 2 != 0 {
            perms |= PERM_WRITE;
        }
        if amode & 1 != 0 {
            perms |= PERM_EXEC;
        }
        self.node_permissions(lookup.node, perms, op, path)
    }

    pub fn chdir(&mut self, path: &str) -> Result<(), VfsError> {
        let op = "chdir";
        let lookup = self.lookup_path(op, path, LookupOptions {
            follow: true,
            ..Default::default()
        })?;
        if !self.nodes.node(lookup.node).is_dir() {
            return Err(VfsError::not_directory(op, path));
        }
        self.node_permissions(lookup.node, PERM_EXEC, op, path)?;
        self.cwd = lookup.path;
        Ok(())
    }

    /// Probe a path without raising errors, reporting what exists and the
    /// errno of whatever failed.
    pub fn analyze_path(&mut self, path: &str, dont_resolve_last_link: bool) -> PathInfo {
        let op = "analyze";
        let follow = !dont_resolve_last_link;
        let path = match self.lookup_path(op, path, LookupOptions {
            follow,
            ..Default::default()
        }) {
            Ok(lookup) => lookup.path,
            Err(_) => path.to_string(),
        };
        let mut info = PathInfo::default();
        match self.lookup_path(op, &path, LookupOptions {
            parent: true,
            ..Default::default()
        }) {
            Ok(lookup) => {
                info.parent_exists = true;
                info.parent_path = Some(lookup.path);
                info.parent_node = Some(lookup.node);
                info.name = Some(path::basename(&path));
            }
            Err(err) => {
                info.error = err.errno();
                return info;
            }
        }
        match self.lookup_path(op, &path, LookupOptions {
            follow,
            ..Default::default()
        }) {
            Ok(lookup) => {
                info.exists = true;
                info.is_root = lookup.path == "/";
                info.name = Some(self.nodes.node(lookup.node).name.clone());
                info.path = Some(lookup.path);
                info.node = Some(lookup.node);
            }
            Err(err) => info.error = err.errno(),
        }
        info
    }

    // ------------------------------------------------------------------
    // bootstrap pieces

    pub fn create_default_directories(&mut self) -> Result<(), VfsError> {
        self.mkdir("/tmp", 511)?;
        self.mkdir("/home", 511)?;
        self.mkdir("/home/web_user", 511)?;
        Ok(())
    }

    pub fn create_default_devices(&mut self, stdout: ConsoleDevice, stderr: ConsoleDevice) -> Result<(), VfsError> {
        self.mkdir("/dev", 511)?;
        self.register_device(types::make_dev(1, 3), Box::new(NullDevice));
        self.mkdev("/dev/null", 438, types::make_dev(1, 3))?;
        self.register_device(types::make_dev(5, 0), Box::new(stdout));
        self.register_device(types::make_dev(6, 0), Box::new(stderr));
        self.mkdev("/dev/tty", 438, types::make_dev(5, 0))?;
        self.mkdev("/dev/tty1", 438, types::make_dev(6, 0))?;
        // read-only entropy taps
        self.register_device(types::make_dev(64, 0), Box::new(RandomDevice));
        self.register_device(types::make_dev(65, 0), Box::new(RandomDevice));
        self.mkdev("/dev/random", 365, types::make_dev(64, 0))?;
        self.mkdev("/dev/urandom", 365, types::make_dev(65, 0))?;
        self.mkdir("/dev/shm", 511)?;
        self.mkdir("/dev/shm/tmp", 511)?;
        Ok(())
    }

    pub fn create_special_directories(&mut self) -> Result<(), VfsError> {
        self.mkdir("/proc", 511)?;
        self.mkdir("/proc/self", 511)?;
        self.mkdir("/proc/self/fd", 511)?;
        self.mount(Box::new(ProcFdFs), "/proc/self/fd")?;
        Ok(())
    }

    pub fn create_standard_streams(&mut self) -> Result<(), VfsError> {
        self.symlink("/dev/tty", "/dev/stdin")?;
        self.symlink("/dev/tty", "/dev/stdout")?;
        self.symlink("/dev/tty1", "/dev/stderr")?;
        let stdin = self.open_mode("/dev/stdin", "r")?;
        assert_eq!(stdin, 0, "stdin landed on descriptor {}", stdin);
        let stdout = self.open_mode("/dev/stdout", "w")?;
        assert_eq!(stdout, 1, "stdout landed on descriptor {}", stdout);
        let stderr = self.open_mode("/dev/stderr", "w")?;
        assert_eq!(stderr, 2, "stderr landed on descriptor {}", stderr);
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthetic `/proc/self/fd` tree: looking up a descriptor number yields
/// a fresh symlink node pointing at that stream's path. Nothing here is
/// hashed, so every resolution manufactures its answer anew.
struct ProcFdFs;

impl Backend for ProcFdFs {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError> {
        let root = nodes.create(
            None,
            "fd",
            S_IFDIR | 511,
            0,
            mount,
            NodePayload::Directory {
                children: IndexMap::new(),
            },
        );
        nodes.node_mut(root).node_caps = NodeCaps::LOOKUP;
        nodes.node_mut(root).stream_caps = StreamCaps::empty();
        Ok(root)
    }

    fn lookup(
        &mut self,
        nodes: &mut NodeTable,
        streams: &StreamTable,
        parent: NodeId,
        name: &str,
        op: &str,
        _path: &str,
    ) -> Result<NodeId, VfsError> {
        let fd: usize = name.parse().map_err(|_| VfsError::bad_descriptor(op))?;
        let stream = match streams.get(fd) {
            Some(stream) => stream,
            None => return Err(VfsError::bad_descriptor(op)),
        };
        let mount = nodes.node(parent).mount;
        let target = stream.path.clone();
        let id = nodes.create_unhashed(
            None,
            name,
            S_IFLNK | 511,
            0,
            mount,
            NodePayload::Symlink { target },
        );
        nodes.node_mut(id).node_caps = NodeCaps::READLINK;
        nodes.node_mut(id).stream_caps = StreamCaps::empty();
        Ok(id)
    }

    fn readlink(&self, nodes: &NodeTable, id: NodeId) -> Result<String, VfsError> {
        match &nodes.node(id).payload {
            NodePayload::Symlink { target } => Ok(target.clone()),
            _ => panic!("procfs: readlink on a non-symlink node"),
        }
    }
}
