//! Blob Backend
//!
//! Read-only mounts built from preloaded data. Files are windows into
//! shared byte packages, so mounting never copies the payload. Any
//! mutation is refused.

use std::sync::Arc;

use crate::backend::Backend;
use crate::errors::VfsError;
use crate::fs::mount::MountId;
use crate::fs::node_table::{NodeId, NodePayload, NodeTable};
use crate::fs::streams::{Stream, StreamTable};
use crate::fs::types::{
    AttrPatch, FileAttr, NodeCaps, StreamCaps, SEEK_CUR, SEEK_END,
};
use crate::path;

const DIR_MODE: u32 = 16895;
const FILE_MODE: u32 = 33279;

/// One file of a blob mount: a slice of a shared package.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub path: String,
    pub data: Arc<Vec<u8>>,
    pub start: usize,
    pub len: usize,
}

pub struct BlobFs {
    entries: Vec<BlobEntry>,
}

impl BlobFs {
    pub fn new() -> Self {
        BlobFs {
            entries: Vec::new(),
        }
    }

    /// Add a standalone file.
    pub fn add_file(&mut self, file_path: &str, data: Vec<u8>) {
        let len = data.len();
        self.entries.push(BlobEntry {
            path: path::normalize(file_path),
            data: Arc::new(data),
            start: 0,
            len,
        });
    }

    /// Add files that all slice into one shared package. Ranges are
    /// half-open `(path, start, end)` offsets into `data`.
    pub fn add_package(&mut self, data: Vec<u8>, files: &[(String, usize, usize)]) {
        let data = Arc::new(data);
        for (file_path, start, end) in files {
            self.entries.push(BlobEntry {
                path: path::normalize(file_path),
                data: data.clone(),
                start: *start,
                len: end - start,
            });
        }
    }

    fn create_node(
        nodes: &mut NodeTable,
        parent: Option<NodeId>,
        name: &str,
        mode: u32,
        mount: MountId,
        payload: NodePayload,
    ) -> NodeId {
        let id = nodes.create(parent, name, mode, 0, mount, payload);
        if let Some(parent) = parent {
            if let Some(children) = nodes.node_mut(parent).children_mut() {
                children.insert(name.to_string(), id);
            }
        }
        let node = nodes.node_mut(id);
        node.node_caps = NodeCaps::all() - NodeCaps::READLINK;
        node.stream_caps = StreamCaps::READ | StreamCaps::WRITE | StreamCaps::LLSEEK;
        id
    }
}

impl Default for BlobFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for BlobFs {
    fn name(&self) -> &'static str {
        "blobfs"
    }

    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError> {
        let root = Self::create_node(
            nodes,
            None,
            "/",
            DIR_MODE,
            mount,
            NodePayload::Directory {
                children: indexmap::IndexMap::new(),
            },
        );
        let entries = std::mem::take(&mut self.entries);
        for entry in entries {
            let parts: Vec<&str> = entry
                .path
                .split('/')
                .filter(|part| !part.is_empty())
                .collect();
            if parts.is_empty() {
                continue;
            }
            let mut current = root;
            for part in &parts[..parts.len() - 1] {
                current = match nodes.probe(current, part) {
                    Some(existing) => existing,
                    None => Self::create_node(
                        nodes,
                        Some(current),
                        part,
                        DIR_MODE,
                        mount,
                        NodePayload::Directory {
                            children: indexmap::IndexMap::new(),
                        },
                    ),
                };
            }
            Self::create_node(
                nodes,
                Some(current),
                parts[parts.len() - 1],
                FILE_MODE,
                mount,
                NodePayload::Blob {
                    data: entry.data,
                    start: entry.start,
                    len: entry.len,
                },
            );
        }
        Ok(root)
    }

    fn getattr(&self, nodes: &NodeTable, id: NodeId) -> Result<FileAttr, VfsError> {
        let node = nodes.node(id);
        let size = node.size();
        Ok(FileAttr {
            dev: 1,
            ino: id.as_u64(),
            mode: node.mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
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
        // Size changes are silently dropped; the payload is immutable.
        let node = nodes.node_mut(id);
        if let Some(mode) = patch.mode {
            node.mode = mode;
        }
        if let Some(timestamp) = patch.timestamp_ms {
            node.timestamp_ms = timestamp;
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
        Err(VfsError::not_found(op, path))
    }

    fn mknod(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _mode: u32,
        _rdev: u32,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        Err(VfsError::not_permitted(op, path))
    }

    fn rename(
        &mut self,
        _nodes: &mut NodeTable,
        _old: NodeId,
        _new_parent: NodeId,
        _new_name: &str,
        op: &str,
        new_path: &str,
    ) -> Result<(), VfsError> {
        Err(VfsError::not_permitted(op, new_path))
    }

    fn unlink(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        Err(VfsError::not_permitted(op, path))
    }

    fn rmdir(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        Err(VfsError::not_permitted(op, path))
    }

    fn readdir(&self, nodes: &NodeTable, id: NodeId) -> Result<Vec<String>, VfsError> {
        let children = match nodes.node(id).children() {
            Some(children) => children,
            None => panic!("blobfs: readdir on non-directory node"),
        };
        let mut entries = vec![".".to_string(), "..".to_string()];
        entries.extend(children.keys().cloned());
        Ok(entries)
    }

    fn symlink(
        &mut self,
        _nodes: &mut NodeTable,
        _parent: NodeId,
        _name: &str,
        _target: &str,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        Err(VfsError::not_permitted(op, path))
    }

    fn read(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize, VfsError> {
        let node = nodes.node(stream.node);
        let (data, start, len) = match &node.payload {
            NodePayload::Blob { data, start, len } => (data, *start, *len),
            _ => panic!("blobfs: read on non-blob node"),
        };
        let position = position as usize;
        if position >= len {
            return Ok(0);
        }
        let size = (len - position).min(buf.len());
        buf[..size].copy_from_slice(&data[start + position..start + position + size]);
        Ok(size)
    }

    fn write(
        &mut self,
        _nodes: &mut NodeTable,
        stream: &mut Stream,
        _buf: &[u8],
        _position: u64,
        _can_own: bool,
    ) -> Result<usize, VfsError> {
        Err(VfsError::not_permitted("write", &stream.path))
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted() -> (BlobFs, NodeTable, NodeId) {
        let mut fs = BlobFs::new();
        fs.add_file("/a/b.txt", b"hello".to_vec());
        fs.add_package(
            b"0123456789".to_vec(),
            &[
                ("/pack/one".to_string(), 0, 4),
                ("/pack/two".to_string(), 4, 10),
            ],
        );
        let mut nodes = NodeTable::new();
        let root = fs.mount(&mut nodes, MountId(0)).unwrap();
        (fs, nodes, root)
    }

    fn resolve(nodes: &NodeTable, root: NodeId, parts: &[&str]) -> NodeId {
        let mut current = root;
        for part in parts {
            current = nodes.probe(current, part).unwrap();
        }
        current
    }

    #[test]
    fn test_mount_builds_tree() {
        let (mut fs, nodes, root) = mounted();
        let mut listing = fs.readdir(&nodes, root).unwrap();
        listing.sort();
        assert_eq!(listing, vec![".", "..", "a", "pack"]);
        let file = resolve(&nodes, root, &["a", "b.txt"]);
        assert_eq!(nodes.node(file).size(), 5);
        assert_eq!(nodes.node(file).mode, FILE_MODE);
    }

    #[test]
    fn test_package_slices_share_data() {
        let (mut fs, mut nodes, root) = mounted();
        let one = resolve(&nodes, root, &["pack", "one"]);
        let two = resolve(&nodes, root, &["pack", "two"]);

        let mut stream = Stream::new(one, "/pack/one".to_string(), 0, StreamCaps::READ);
        let mut buf = [0u8; 16];
        let read = fs.read(&mut nodes, &mut stream, &mut buf, 0).unwrap();
        assert_eq!(&buf[..read], b"0123");

        let mut stream = Stream::new(two, "/pack/two".to_string(), 0, StreamCaps::READ);
        let read = fs.read(&mut nodes, &mut stream, &mut buf, 2).unwrap();
        assert_eq!(&buf[..read], b"6789");
    }

    #[test]
    fn test_mutations_are_refused() {
        let (mut fs, mut nodes, root) = mounted();
        let err = fs
            .mknod(&mut nodes, root, "x", FILE_MODE, 0, "mknod", "/x")
            .unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
        let err = fs
            .unlink(&mut nodes, root, "a", "unlink", "/a")
            .unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);

        let file = resolve(&nodes, root, &["a", "b.txt"]);
        let mut stream = Stream::new(file, "/a/b.txt".to_string(), 1, StreamCaps::WRITE);
        let err = fs
            .write(&mut nodes, &mut stream, b"nope", 0, false)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EPERM);
    }

    #[test]
    fn test_truncate_is_silently_ignored() {
        let (mut fs, mut nodes, root) = mounted();
        let file = resolve(&nodes, root, &["a", "b.txt"]);
        fs.setattr(
            &mut nodes,
            file,
            &AttrPatch {
                size: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(nodes.node(file).size(), 5);
    }

    #[test]
    fn test_llseek_uses_blob_size() {
        let (mut fs, nodes, root) = mounted();
        let file = resolve(&nodes, root, &["a", "b.txt"]);
        let stream = Stream::new(file, "/a/b.txt".to_string(), 0, StreamCaps::READ);
        assert_eq!(fs.llseek(&nodes, &stream, 0, SEEK_END).unwrap(), 5);
    }
}
