//! Filesystem Backends
//!
//! A backend owns the storage behind one mount. The shared node table and
//! descriptor table are passed into every call so backends stay free of
//! interior locking; the context enforces permissions and capabilities
//! before a backend method runs.

pub mod blobfs;
pub mod durable;
pub mod hostfs;
pub mod memfs;
pub mod store;

use async_trait::async_trait;

use crate::errors::{SyncError, VfsError};
use crate::fs::mount::MountId;
use crate::fs::node_table::{NodeId, NodeTable};
use crate::fs::streams::{Stream, StreamTable};
use crate::fs::types::{AttrPatch, FileAttr, MmapResult};
use crate::heap::memory::LinearMemory;

pub use blobfs::{BlobEntry, BlobFs};
pub use durable::DurableFs;
pub use hostfs::HostFs;
pub use memfs::MemFs;
pub use store::{EntryStore, JsonFileStore, MemoryStore, StoreEntry};

/// Storage behind one mount.
///
/// Callers only invoke an operation when the node or stream capability
/// set advertises it, so the default bodies mark wiring defects rather
/// than reachable error paths. `op` and `path` carry the caller's
/// operation name and the absolute path for error messages.
#[async_trait]
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Create the root node of a fresh mount.
    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError>;

    fn getattr(&self, _nodes: &NodeTable, _id: NodeId) -> Result<FileAttr, VfsError> {
        panic!("{}: getattr not implemented", self.name())
    }

    fn setattr(
        &mut self,
        _nodes: &mut NodeTable,
        _id: NodeId,
        _patch: &AttrPatch,
    ) -> Result<(), VfsError> {
        panic!("{}: setattr not implemented", self.name())
    }

    /// Find a child the hash index does not know about.
    fn lookup(
        &mut self,
        _nodes: &mut NodeTable,
        _streams: &StreamTable,
        _parent: NodeId,
        _name: &str,
        _op: &str,
        _path: &str,
    ) -> Result<NodeId, VfsError> {
        panic!("{}: lookup not implemented", self.name())
    }

    #[allow(clippy::too_many_arguments)]
    fn mknod(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _mode: u32,
        _rdev: u32,
        _op: &str,
        _path: &str,
    ) -> Result<NodeId, VfsError> {
        panic!("{}: mknod not implemented", self.name())
    }

    fn rename(
        &mut self,
        _nodes: &mut NodeTable,
        _old: NodeId,
        _new_parent: NodeId,
        _new_name: &str,
        _op: &str,
        _new_path: &str,
    ) -> Result<(), VfsError> {
        panic!("{}: rename not implemented", self.name())
    }

    fn unlink(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _op: &str,
        _path: &str,
    ) -> Result<(), VfsError> {
        panic!("{}: unlink not implemented", self.name())
    }

    fn rmdir(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _op: &str,
        _path: &str,
    ) -> Result<(), VfsError> {
        panic!("{}: rmdir not implemented", self.name())
    }

    fn readdir(&self, _nodes: &NodeTable, _id: NodeId) -> Result<Vec<String>, VfsError> {
        panic!("{}: readdir not implemented", self.name())
    }

    #[allow(clippy::too_many_arguments)]
    fn symlink(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _target: &str,
        _op: &str,
        _path: &str,
    ) -> Result<NodeId, VfsError> {
        panic!("{}: symlink not implemented", self.name())
    }

    fn readlink(&self, _nodes: &NodeTable, _id: NodeId) -> Result<String, VfsError> {
        panic!("{}: readlink not implemented", self.name())
    }

    /// Hook run when a stream opens on a node of this mount.
    fn open(&mut self, _nodes: &mut NodeTable, _stream: &mut Stream) -> Result<(), VfsError> {
        Ok(())
    }

    /// Hook run when a stream closes. The descriptor slot is already freed
    /// when this runs.
    fn close(&mut self, _nodes: &mut NodeTable, _stream: &mut Stream) -> Result<(), VfsError> {
        Ok(())
    }

    fn read(
        &mut self,
        _nodes: &mut NodeTable,
        _stream: &mut Stream,
        _buf: &mut [u8],
        _position: u64,
    ) -> Result<usize, VfsError> {
        panic!("{}: read not implemented", self.name())
    }

    fn write(
        &mut self,
        _nodes: &mut NodeTable,
        _stream: &mut Stream,
        _buf: &[u8],
        _position: u64,
        _can_own: bool,
    ) -> Result<usize, VfsError> {
        panic!("{}: write not implemented", self.name())
    }

    fn llseek(
        &mut self,
        _nodes: &NodeTable,
        _stream: &Stream,
        _offset: i64,
        _whence: u32,
    ) -> Result<u64, VfsError> {
        panic!("{}: llseek not implemented", self.name())
    }

    fn allocate(
        &mut self,
        _nodes: &mut NodeTable,
        _stream: &Stream,
        _offset: u64,
        _length: u64,
    ) -> Result<(), VfsError> {
        panic!("{}: allocate not implemented", self.name())
    }

    #[allow(clippy::too_many_arguments)]
    fn mmap(
        &mut self,
        _nodes: &mut NodeTable,
        _heap: &mut LinearMemory,
        _stream: &Stream,
        _length: usize,
        _prot: u32,
        _flags: u32,
        _position: u64,
    ) -> Result<MmapResult, VfsError> {
        panic!("{}: mmap not implemented", self.name())
    }

    /// Write a mapped region back to the file at the given offset.
    fn msync(
        &mut self,
        _nodes: &mut NodeTable,
        _stream: &mut Stream,
        _buf: &[u8],
        _offset: u64,
        _mmap_flags: u32,
    ) -> Result<(), VfsError> {
        panic!("{}: msync not implemented", self.name())
    }

    /// Synchronize the mount with persistent storage. `populate` pulls
    /// from the store into memory instead of pushing.
    async fn syncfs(
        &mut self,
        _nodes: &mut NodeTable,
        _mountpoint: &str,
        _root: NodeId,
        _populate: bool,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}
