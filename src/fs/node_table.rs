//! Node Table
//!
//! Arena of filesystem nodes plus the name-hash index used for lookups.
//! Node slots are never reused: removing a name only unhooks the node from
//! the hash index, so open descriptors keep a valid view of the node.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::fs::mount::MountId;
use crate::fs::types::{self, NodeCaps, StreamCaps};

/// Number of buckets in the name-hash index.
const NAME_TABLE_SIZE: usize = 4096;

/// Identifier of a node; doubles as the inode number reported by stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    fn index(&self) -> usize {
        self.0 - 1
    }
}

/// Kind-specific storage attached to a node.
#[derive(Debug, Clone)]
pub enum NodePayload {
    Directory {
        /// Children in creation order, as directory listings report them.
        children: IndexMap<String, NodeId>,
    },
    File {
        /// Backing buffer; `contents.len()` is the allocated capacity.
        contents: Vec<u8>,
        /// Bytes of `contents` that hold file data.
        used: usize,
    },
    Blob {
        /// Shared immutable package the node is a window into.
        data: Arc<Vec<u8>>,
        start: usize,
        len: usize,
    },
    Symlink {
        target: String,
    },
    Device,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Parent node; the root of a mount points at itself.
    pub parent: NodeId,
    /// Mount this node belongs to.
    pub mount: MountId,
    /// Mount whose root covers this node, when one is attached here.
    pub mounted: Option<MountId>,
    pub name: String,
    pub mode: u32,
    pub rdev: u32,
    pub timestamp_ms: i64,
    pub node_caps: NodeCaps,
    pub stream_caps: StreamCaps,
    pub payload: NodePayload,
    /// Next node in the same hash bucket.
    name_next: Option<NodeId>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent == self.id
    }

    pub fn is_dir(&self) -> bool {
        types::is_dir(self.mode)
    }

    pub fn is_file(&self) -> bool {
        types::is_file(self.mode)
    }

    pub fn is_link(&self) -> bool {
        types::is_link(self.mode)
    }

    pub fn is_chrdev(&self) -> bool {
        types::is_chrdev(self.mode)
    }

    pub fn children(&self) -> Option<&IndexMap<String, NodeId>> {
        match &self.payload {
            NodePayload::Directory { children } => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut IndexMap<String, NodeId>> {
        match &mut self.payload {
            NodePayload::Directory { children } => Some(children),
            _ => None,
        }
    }

    /// Logical size backing the stat size field.
    pub fn size(&self) -> u64 {
        match &self.payload {
            NodePayload::Directory { .. } => 4096,
            NodePayload::File { used, .. } => *used as u64,
            NodePayload::Blob { len, .. } => *len as u64,
            NodePayload::Symlink { target } => target.len() as u64,
            NodePayload::Device => 0,
        }
    }
}

/// Arena of nodes plus the (parent, name) hash index.
pub struct NodeTable {
    nodes: Vec<Node>,
    buckets: Vec<Option<NodeId>>,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable {
            nodes: Vec::new(),
            buckets: vec![None; NAME_TABLE_SIZE],
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Allocate a node and link it into the hash index.
    ///
    /// `parent` of `None` makes the node a mount root, its own parent.
    pub fn create(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        mode: u32,
        rdev: u32,
        mount: MountId,
        payload: NodePayload,
    ) -> NodeId {
        let id = self.create_unhashed(parent, name, mode, rdev, mount, payload);
        self.hash_add(id);
        id
    }

    /// Allocate a node that lookups cannot find, for synthetic entries
    /// manufactured per resolution.
    pub fn create_unhashed(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        mode: u32,
        rdev: u32,
        mount: MountId,
        payload: NodePayload,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() + 1);
        self.nodes.push(Node {
            id,
            parent: parent.unwrap_or(id),
            mount,
            mounted: None,
            name: name.to_string(),
            mode,
            rdev,
            timestamp_ms: types::now_ms(),
            node_caps: types::default_node_caps(mode),
            stream_caps: types::default_stream_caps(mode),
            payload,
            name_next: None,
        });
        id
    }

    /// Unhook a node whose name was removed. The slot stays live for any
    /// descriptor still open on it.
    pub fn destroy(&mut self, id: NodeId) {
        self.hash_remove(id);
    }

    pub fn hash_add(&mut self, id: NodeId) {
        let bucket = {
            let node = self.node(id);
            Self::bucket_for(node.parent, &node.name)
        };
        self.node_mut(id).name_next = self.buckets[bucket];
        self.buckets[bucket] = Some(id);
    }

    pub fn hash_remove(&mut self, id: NodeId) {
        let bucket = {
            let node = self.node(id);
            Self::bucket_for(node.parent, &node.name)
        };
        let mut current = self.buckets[bucket];
        if current == Some(id) {
            self.buckets[bucket] = self.node(id).name_next;
            return;
        }
        while let Some(curr_id) = current {
            let next = self.node(curr_id).name_next;
            if next == Some(id) {
                self.node_mut(curr_id).name_next = self.node(id).name_next;
                return;
            }
            current = next;
        }
    }

    /// Find a child by name through the hash index.
    pub fn probe(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let bucket = Self::bucket_for(parent, name);
        let mut current = self.buckets[bucket];
        while let Some(id) = current {
            let node = self.node(id);
            if node.parent == parent && node.name == name {
                return Some(id);
            }
            current = node.name_next;
        }
        None
    }

    /// Drop every hash entry belonging to one of the given mounts. Used
    /// when a mount subtree is detached.
    pub fn purge_mounts(&mut self, mounts: &[MountId]) {
        for bucket in 0..NAME_TABLE_SIZE {
            let mut current = self.buckets[bucket];
            self.buckets[bucket] = None;
            // Rebuild the chain keeping only survivors; order within a
            // bucket does not affect lookups.
            while let Some(id) = current {
                let next = self.node(id).name_next;
                if !mounts.contains(&self.node(id).mount) {
                    self.node_mut(id).name_next = self.buckets[bucket];
                    self.buckets[bucket] = Some(id);
                }
                current = next;
            }
        }
    }

    fn bucket_for(parent: NodeId, name: &str) -> usize {
        let mut hash = 0i32;
        for &byte in name.as_bytes() {
            hash = hash
                .wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(byte as i32);
        }
        let mixed = (parent.0 as i32).wrapping_add(hash) as u32;
        (mixed % NAME_TABLE_SIZE as u32) as usize
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::types::{S_IFDIR, S_IFREG};

    fn dir_payload() -> NodePayload {
        NodePayload::Directory {
            children: IndexMap::new(),
        }
    }

    fn file_payload() -> NodePayload {
        NodePayload::File {
            contents: Vec::new(),
            used: 0,
        }
    }

    #[test]
    fn test_root_is_own_parent() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        assert!(table.node(root).is_root());
        assert_eq!(table.node(root).parent, root);
    }

    #[test]
    fn test_probe_finds_hashed_node() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let file = table.create(
            Some(root),
            "hello.txt",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        assert_eq!(table.probe(root, "hello.txt"), Some(file));
        assert_eq!(table.probe(root, "other.txt"), None);
    }

    #[test]
    fn test_destroy_unhooks_but_keeps_slot() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let file = table.create(
            Some(root),
            "doomed",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        table.destroy(file);
        assert_eq!(table.probe(root, "doomed"), None);
        // The node itself survives for open descriptors.
        assert_eq!(table.node(file).name, "doomed");
    }

    #[test]
    fn test_colliding_bucket_chain() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let subdir = table.create(Some(root), "sub", S_IFDIR | 511, 0, MountId(0), dir_payload());
        // (parent 1, "b") and (parent 2, "a") land in the same bucket since
        // the byte hashes differ by exactly one.
        let in_root = table.create(
            Some(root),
            "b",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        let in_sub = table.create(
            Some(subdir),
            "a",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        assert_eq!(table.probe(root, "b"), Some(in_root));
        assert_eq!(table.probe(subdir, "a"), Some(in_sub));
        table.hash_remove(in_sub);
        assert_eq!(table.probe(subdir, "a"), None);
        assert_eq!(table.probe(root, "b"), Some(in_root));
    }

    #[test]
    fn test_create_unhashed_is_invisible() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let ghost = table.create_unhashed(
            Some(root),
            "ghost",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        assert_eq!(table.probe(root, "ghost"), None);
        assert_eq!(table.node(ghost).name, "ghost");
    }

    #[test]
    fn test_purge_mounts_drops_only_matching() {
        let mut table = NodeTable::new();
        let root = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let keep = table.create(
            Some(root),
            "keep",
            S_IFREG | 438,
            0,
            MountId(0),
            file_payload(),
        );
        let lose = table.create(
            Some(root),
            "lose",
            S_IFREG | 438,
            0,
            MountId(1),
            file_payload(),
        );
        table.purge_mounts(&[MountId(1)]);
        assert_eq!(table.probe(root, "keep"), Some(keep));
        assert_eq!(table.probe(root, "lose"), None);
        assert_eq!(table.node(lose).name, "lose");
    }

    #[test]
    fn test_node_ids_are_monotonic_from_one() {
        let mut table = NodeTable::new();
        let a = table.create(None, "/", S_IFDIR | 511, 0, MountId(0), dir_payload());
        let b = table.create(Some(a), "x", S_IFREG | 438, 0, MountId(0), file_payload());
        assert_eq!(a.as_u64(), 1);
        assert_eq!(b.as_u64(), 2);
    }
}
