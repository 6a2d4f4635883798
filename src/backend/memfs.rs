//! In-Memory Backend
//!
//! The default backend. Directories are ordered child maps, files are
//! growable byte buffers with a capacity kept ahead of the logical size
//! so appends stay cheap.

use crate::backend::Backend;
use crate::errors::VfsError;
use crate::fs::mount::MountId;
use crate::fs::node_table::{NodeId, NodePayload, NodeTable};
use crate::fs::streams::{Stream, StreamTable};
use crate::fs::types::{
    self, AttrPatch, FileAttr, MmapResult, SEEK_CUR, SEEK_END, S_IFDIR,
};
use crate::heap::memory::LinearMemory;

/// Capacity doubles up to here, then grows by an eighth per expansion.
const CAPACITY_DOUBLING_MAX: usize = 1024 * 1024;

pub struct MemFs;

impl MemFs {
    pub fn new() -> Self {
        MemFs
    }

    /// Allocate a node and register it with its parent directory.
    pub(crate) fn create_node(
        nodes: &mut NodeTable,
        parent: Option<NodeId>,
        name: &str,
        mode: u32,
        rdev: u32,
        mount: MountId,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        if types::is_blkdev(mode) || types::is_fifo(mode) {
            return Err(VfsError::not_permitted(op, path));
        }
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
            NodePayload::Device
        };
        let id = nodes.create(parent, name, mode, rdev, mount, payload);
        if let Some(parent) = parent {
            if let Some(children) = nodes.node_mut(parent).children_mut() {
                children.insert(name.to_string(), id);
            }
        }
        Ok(id)
    }

    fn expand_file_storage(contents: &mut Vec<u8>, used: usize, new_capacity: usize) {
        let prev = contents.len();
        if prev >= new_capacity {
            return;
        }
        let factor = if prev < CAPACITY_DOUBLING_MAX { 2.0 } else { 1.125 };
        let mut capacity = new_capacity.max((prev as f64 * factor) as usize);
        if prev != 0 {
            capacity = capacity.max(256);
        }
        let mut grown = vec![0u8; capacity];
        grown[..used].copy_from_slice(&contents[..used]);
        *contents = grown;
    }

    fn resize_file_storage(contents: &mut Vec<u8>, used: &mut usize, new_size: usize) {
        if *used == new_size {
            return;
        }
        if new_size == 0 {
            contents.clear();
            contents.shrink_to_fit();
            *used = 0;
            return;
        }
        let mut resized = vec![0u8; new_size];
        let keep = new_size.min(*used);
        resized[..keep].copy_from_slice(&contents[..keep]);
        *contents = resized;
        *used = new_size;
    }

    fn file_parts(node: &mut crate::fs::node_table::Node) -> (&mut Vec<u8>, &mut usize) {
        match &mut node.payload {
            NodePayload::File { contents, used } => (contents, used),
            _ => panic!("memfs: node is not a regular file"),
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemFs {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError> {
        Self::create_node(nodes, None, "/", S_IFDIR | 511, 0, mount, "mount", "/")
    }

    fn getattr(&self, nodes: &NodeTable, id: NodeId) -> Result<FileAttr, VfsError> {
        let node = nodes.node(id);
        let size = node.size();
        Ok(FileAttr {
            dev: if node.is_chrdev() { id.as_u64() as u32 } else { 1 },
            ino: id.as_u64(),
            mode: node.mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: node.rdev,
            size,
            atime_ms: node.timestamp_ms,
            mtime_ms: node.timestamp_ms,
            ctime_ms: node.timestamp_ms,
            blksize: 4096,
            blocks: size.div_ceil(4096) as u32,
        })
    }

    fn setattr(
        &mut self,
        nodes: &mut NodeTable,
        id: NodeId,
        patch: &AttrPatch,
    ) -> Result<(), VfsError> {
        let node = nodes.node_mut(id);
        if let Some(mode) = patch.mode {
            node.mode = mode;
        }
        if let Some(timestamp) = patch.timestamp_ms {
            node.timestamp_ms = timestamp;
        }
        if let Some(size) = patch.size {
            let (contents, used) = Self::file_parts(node);
            Self::resize_file_storage(contents, used, size as usize);
        }
        Ok(())
    }

    fn lookup(
        &mut self,
        _nodes: &mut NodeTable,
        _streams: &StreamTable,
        _parent: NodeId,
        _name: &str,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        // Everything lives in the node table; a miss there is a miss.
        Err(VfsError::not_found(op, path))
    }

    fn mknod(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        mode: u32,
        rdev: u32,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        let mount = nodes.node(parent).mount;
        Self::create_node(nodes, Some(parent), name, mode, rdev, mount, op, path)
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
        // Overwriting a directory requires the target to be empty.
        if nodes.node(old).is_dir() {
            if let Some(existing) = nodes.probe(new_parent, new_name) {
                if nodes
                    .node(existing)
                    .children()
                    .map(|children| !children.is_empty())
                    .unwrap_or(false)
                {
                    return Err(VfsError::NotEmpty {
                        path: new_path.to_string(),
                        operation: op.to_string(),
                    });
                }
            }
        }
        if let Some(replaced) = nodes.probe(new_parent, new_name) {
            nodes.hash_remove(replaced);
        }
        let (old_parent, old_name) = {
            let node = nodes.node(old);
            (node.parent, node.name.clone())
        };
        if let Some(children) = nodes.node_mut(old_parent).children_mut() {
            children.shift_remove(&old_name);
        }
        nodes.node_mut(old).name = new_name.to_string();
        if let Some(children) = nodes.node_mut(new_parent).children_mut() {
            children.insert(new_name.to_string(), old);
        }
        nodes.node_mut(old).parent = new_parent;
        Ok(())
    }

    fn unlink(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        _op: &str,
        _path: &str,
    ) -> Result<(), VfsError> {
        if let Some(children) = nodes.node_mut(parent).children_mut() {
            children.shift_remove(name);
        }
        Ok(())
    }

    fn rmdir(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        let node = match nodes.probe(parent, name) {
            Some(id) => id,
            None => return Err(VfsError::not_found(op, path)),
        };
        if nodes
            .node(node)
            .children()
            .map(|children| !children.is_empty())
            .unwrap_or(false)
        {
            return Err(VfsError::NotEmpty {
                path: path.to_string(),
                operation: op.to_string(),
            });
        }
        if let Some(children) = nodes.node_mut(parent).children_mut() {
            children.shift_remove(name);
        }
        Ok(())
    }

    fn readdir(&self, nodes: &NodeTable, id: NodeId) -> Result<Vec<String>, VfsError> {
        let children = match nodes.node(id).children() {
            Some(children) => children,
            None => panic!("memfs: readdir on non-directory node"),
        };
        let mut entries = vec![".".to_string(), "..".to_string()];
        entries.extend(children.keys().cloned());
        Ok(entries)
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
        let mount = nodes.node(parent).mount;
        let id = Self::create_node(
            nodes,
            Some(parent),
            name,
            511 | types::S_IFLNK,
            0,
            mount,
            op,
            path,
        )?;
        if let NodePayload::Symlink { target: slot } = &mut nodes.node_mut(id).payload {
            *slot = target.to_string();
        }
        Ok(id)
    }

    fn readlink(&self, nodes: &NodeTable, id: NodeId) -> Result<String, VfsError> {
        match &nodes.node(id).payload {
            NodePayload::Symlink { target } => Ok(target.clone()),
            _ => panic!("memfs: readlink on non-symlink node"),
        }
    }

    fn read(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize, VfsError> {
        let node = nodes.node(stream.node);
        let (contents, used) = match &node.payload {
            NodePayload::File { contents, used } => (contents, *used),
            _ => panic!("memfs: read on non-regular node"),
        };
        let position = position as usize;
        if position >= used {
            return Ok(0);
        }
        let size = (used - position).min(buf.len());
        buf[..size].copy_from_slice(&contents[position..position + size]);
        Ok(size)
    }

    fn write(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &[u8],
        position: u64,
        can_own: bool,
    ) -> Result<usize, VfsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let node = nodes.node_mut(stream.node);
        node.timestamp_ms = types::now_ms();
        let (contents, used) = Self::file_parts(node);
        let position = position as usize;
        if position == 0 && (can_own || *used == 0) {
            // Fresh or whole-file write: take an exact-size buffer.
            *contents = buf.to_vec();
            *used = buf.len();
            return Ok(buf.len());
        }
        if position + buf.len() <= *used {
            contents[position..position + buf.len()].copy_from_slice(buf);
            return Ok(buf.len());
        }
        Self::expand_file_storage(contents, *used, position + buf.len());
        contents[position..position + buf.len()].copy_from_slice(buf);
        *used = (*used).max(position + buf.len());
        Ok(buf.len())
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
        } else if whence == SEEK_END {
            let node = nodes.node(stream.node);
            if node.is_file() {
                position += node.size() as i64;
            }
        }
        if position < 0 {
            return Err(VfsError::invalid_argument("llseek", &stream.path));
        }
        Ok(position as u64)
    }

    fn allocate(
        &mut self,
        nodes: &mut NodeTable,
        stream: &Stream,
        offset: u64,
        length: u64,
    ) -> Result<(), VfsError> {
        let node = nodes.node_mut(stream.node);
        let (contents, used) = Self::file_parts(node);
        let limit = (offset + length) as usize;
        Self::expand_file_storage(contents, *used, limit);
        *used = (*used).max(limit);
        Ok(())
    }

    fn mmap(
        &mut self,
        nodes: &mut NodeTable,
        heap: &mut LinearMemory,
        stream: &Stream,
        length: usize,
        _prot: u32,
        _flags: u32,
        position: u64,
    ) -> Result<MmapResult, VfsError> {
        let node = nodes.node(stream.node);
        let (contents, used) = match &node.payload {
            NodePayload::File { contents, used } => (contents, *used),
            _ => {
                return Err(VfsError::NoDevice {
                    path: stream.path.clone(),
                    operation: "mmap".to_string(),
                })
            }
        };
        // Mapped regions never alias file storage; hand out a copy.
        let ptr = heap.memalign(crate::heap::MMAP_PAGE_SIZE, length as u32);
        if ptr == 0 {
            return Err(VfsError::OutOfMemory {
                operation: "mmap".to_string(),
            });
        }
        let start = (position as usize).min(used);
        let end = ((position as usize).saturating_add(length)).min(used);
        heap.write_bytes(ptr, &contents[start..end]);
        Ok(MmapResult {
            ptr,
            allocated: true,
        })
    }

    fn msync(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &[u8],
        offset: u64,
        mmap_flags: u32,
    ) -> Result<(), VfsError> {
        if mmap_flags & 2 != 0 {
            // Private mappings are never written back.
            return Ok(());
        }
        self.write(nodes, stream, buf, offset, false)?;
        Ok(())
    }
}
