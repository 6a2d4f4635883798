//! Mount Table
//!
//! Registry of mounted backends. Mount slots stay allocated after an
//! unmount so descriptors opened under a detached mount keep working;
//! detaching only removes the mount from the tree.

use crate::backend::Backend;
use crate::fs::node_table::NodeId;

/// Identifier of a mount record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(pub(crate) usize);

pub struct Mount {
    pub id: MountId,
    pub backend: Box<dyn Backend>,
    pub mountpoint: String,
    pub root: NodeId,
    pub parent: Option<MountId>,
    pub children: Vec<MountId>,
}

pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        MountTable { mounts: Vec::new() }
    }

    /// Id the next added mount will receive. Backends need it before the
    /// record exists so the root node can carry it.
    pub fn next_id(&self) -> MountId {
        MountId(self.mounts.len())
    }

    pub fn add(
        &mut self,
        backend: Box<dyn Backend>,
        mountpoint: String,
        root: NodeId,
        parent: Option<MountId>,
    ) -> MountId {
        let id = self.next_id();
        self.mounts.push(Mount {
            id,
            backend,
            mountpoint,
            root,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.mounts[parent.0].children.push(id);
        }
        id
    }

    pub fn get(&self, id: MountId) -> &Mount {
        &self.mounts[id.0]
    }

    pub fn get_mut(&mut self, id: MountId) -> &mut Mount {
        &mut self.mounts[id.0]
    }

    pub fn backend(&self, id: MountId) -> &dyn Backend {
        self.mounts[id.0].backend.as_ref()
    }

    pub fn backend_mut(&mut self, id: MountId) -> &mut dyn Backend {
        self.mounts[id.0].backend.as_mut()
    }

    /// Detach a mount from its parent's child list. The record survives
    /// for streams still open beneath it.
    pub fn detach(&mut self, id: MountId) {
        if let Some(parent) = self.mounts[id.0].parent {
            self.mounts[parent.0].children.retain(|child| *child != id);
        }
        self.mounts[id.0].parent = None;
    }

    /// Every mount in the subtree rooted at `start`, the start included.
    pub fn subtree(&self, start: MountId) -> Vec<MountId> {
        let mut found = Vec::new();
        let mut check = vec![start];
        while let Some(id) = check.pop() {
            found.push(id);
            check.extend(self.mounts[id.0].children.iter().copied());
        }
        found
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}
