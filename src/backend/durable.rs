//! Durable Backend
//!
//! In-memory semantics with an entry store bolted on. Day to day traffic
//! runs entirely against the node table; an explicit synchronize pass
//! reconciles the mount subtree with the store, newer timestamp winning,
//! in whichever direction the caller asks for.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::backend::memfs::MemFs;
use crate::backend::store::{EntryStore, StoreEntry};
use crate::backend::Backend;
use crate::errors::{StoreError, SyncError, VfsError};
use crate::fs::mount::MountId;
use crate::fs::node_table::{NodeId, NodePayload, NodeTable};
use crate::fs::streams::{Stream, StreamTable};
use crate::fs::types::{
    self, AttrPatch, FileAttr, MmapResult, S_IFDIR, S_IFREG,
};
use crate::heap::memory::LinearMemory;
use crate::path;

pub struct DurableFs {
    inner: MemFs,
    store: Box<dyn EntryStore>,
}

impl DurableFs {
    pub fn new(store: Box<dyn EntryStore>) -> Self {
        DurableFs {
            inner: MemFs::new(),
            store,
        }
    }

    pub fn store_mut(&mut self) -> &mut dyn EntryStore {
        self.store.as_mut()
    }

    /// Paths under the mountpoint with their modification times. The
    /// mount root itself is not an entry.
    fn local_set(&self, nodes: &NodeTable, mountpoint: &str, root: NodeId) -> HashMap<String, i64> {
        let mut entries = HashMap::new();
        let mut check: Vec<(NodeId, String)> = Vec::new();
        if let Some(children) = nodes.node(root).children() {
            for (name, id) in children {
                check.push((*id, path::join2(mountpoint, name)));
            }
        }
        while let Some((id, node_path)) = check.pop() {
            let node = nodes.node(id);
            if let Some(children) = node.children() {
                for (name, child) in children {
                    check.push((*child, path::join2(&node_path, name)));
                }
            }
            entries.insert(node_path, node.timestamp_ms);
        }
        entries
    }

    /// Walk to the parent directory of `abs_path` inside this mount.
    fn resolve_parent(
        nodes: &NodeTable,
        mountpoint: &str,
        root: NodeId,
        abs_path: &str,
        op: &str,
    ) -> Result<(NodeId, String, Option<NodeId>), VfsError> {
        let rel = abs_path.strip_prefix(mountpoint).unwrap_or(abs_path);
        let parts: Vec<&str> = rel.split('/').filter(|part| !part.is_empty()).collect();
        let name = match parts.last() {
            Some(name) => (*name).to_string(),
            None => return Err(VfsError::not_found(op, abs_path)),
        };
        let mut current = root;
        for part in &parts[..parts.len() - 1] {
            current = nodes
                .probe(current, part)
                .ok_or_else(|| VfsError::not_found(op, abs_path))?;
        }
        let existing = nodes.probe(current, &name);
        Ok((current, name, existing))
    }

    fn apply_entry_attrs(
        &mut self,
        nodes: &mut NodeTable,
        id: NodeId,
        entry: &StoreEntry,
    ) -> Result<(), VfsError> {
        let merged = (entry.mode & 4095) | (nodes.node(id).mode & !4095);
        self.inner.setattr(
            nodes,
            id,
            &AttrPatch {
                mode: Some(merged),
                timestamp_ms: Some(types::now_ms()),
                ..Default::default()
            },
        )?;
        self.inner.setattr(
            nodes,
            id,
            &AttrPatch {
                timestamp_ms: Some(entry.timestamp_ms),
                ..Default::default()
            },
        )
    }

    fn store_local(
        &mut self,
        nodes: &mut NodeTable,
        mountpoint: &str,
        root: NodeId,
        abs_path: &str,
        entry: StoreEntry,
    ) -> Result<(), SyncError> {
        let (parent, name, existing) =
            Self::resolve_parent(nodes, mountpoint, root, abs_path, "sync")?;
        let id = if types::is_dir(entry.mode) {
            if existing.is_some() {
                return Err(VfsError::already_exists("mkdir", abs_path).into());
            }
            let mode = (entry.mode & (511 | 512)) | S_IFDIR;
            self.inner
                .mknod(nodes, parent, &name, mode, 0, "mkdir", abs_path)?
        } else if types::is_file(entry.mode) {
            let contents = entry.contents.as_deref().ok_or_else(|| {
                StoreError::Entry(format!("{}: file entry without contents", abs_path))
            })?;
            let id = match existing {
                Some(id) => id,
                None => self
                    .inner
                    .mknod(nodes, parent, &name, S_IFREG | 438, 0, "open", abs_path)?,
            };
            let mut stream = Stream::new(
                id,
                abs_path.to_string(),
                577,
                types::default_stream_caps(S_IFREG),
            );
            self.inner.write(nodes, &mut stream, contents, 0, true)?;
            id
        } else {
            return Err(
                StoreError::Entry(format!("{}: node type not supported", abs_path)).into(),
            );
        };
        self.apply_entry_attrs(nodes, id, &entry)?;
        Ok(())
    }

    fn load_local(
        nodes: &NodeTable,
        mountpoint: &str,
        root: NodeId,
        abs_path: &str,
    ) -> Result<StoreEntry, SyncError> {
        let (_, _, existing) = Self::resolve_parent(nodes, mountpoint, root, abs_path, "sync")?;
        let id = existing.ok_or_else(|| VfsError::not_found("sync", abs_path))?;
        let node = nodes.node(id);
        match &node.payload {
            NodePayload::Directory { .. } => Ok(StoreEntry {
                timestamp_ms: node.timestamp_ms,
                mode: node.mode,
                contents: None,
            }),
            NodePayload::File { contents, used } => Ok(StoreEntry {
                timestamp_ms: node.timestamp_ms,
                mode: node.mode,
                contents: Some(contents[..*used].to_vec()),
            }),
            _ => Err(StoreError::Entry(format!("{}: node type not supported", abs_path)).into()),
        }
    }

    fn remove_local(
        &mut self,
        nodes: &mut NodeTable,
        mountpoint: &str,
        root: NodeId,
        abs_path: &str,
    ) -> Result<(), SyncError> {
        let (parent, name, existing) =
            Self::resolve_parent(nodes, mountpoint, root, abs_path, "sync")?;
        let id = existing.ok_or_else(|| VfsError::not_found("sync", abs_path))?;
        if nodes.node(id).is_dir() {
            self.inner.rmdir(nodes, parent, &name, "rmdir", abs_path)?;
        } else {
            self.inner.unlink(nodes, parent, &name, "unlink", abs_path)?;
        }
        nodes.destroy(id);
        Ok(())
    }
}

#[async_trait]
impl Backend for DurableFs {
    fn name(&self) -> &'static str {
        "durablefs"
    }

    fn mount(&mut self, nodes: &mut NodeTable, mount: MountId) -> Result<NodeId, VfsError> {
        self.inner.mount(nodes, mount)
    }

    fn getattr(&self, nodes: &NodeTable, id: NodeId) -> Result<FileAttr, VfsError> {
        self.inner.getattr(nodes, id)
    }

    fn setattr(
        &mut self,
        nodes: &mut NodeTable,
        id: NodeId,
        patch: &AttrPatch,
    ) -> Result<(), VfsError> {
        self.inner.setattr(nodes, id, patch)
    }

    fn lookup(
        &mut self,
        nodes: &mut NodeTable,
        streams: &StreamTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<NodeId, VfsError> {
        self.inner.lookup(nodes, streams, parent, name, op, path)
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
        self.inner.mknod(nodes, parent, name, mode, rdev, op, path)
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
        self.inner.rename(nodes, old, new_parent, new_name, op, new_path)
    }

    fn unlink(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        self.inner.unlink(nodes, parent, name, op, path)
    }

    fn rmdir(
        &mut self,
        nodes: &mut NodeTable,
        parent: NodeId,
        name: &str,
        op: &str,
        path: &str,
    ) -> Result<(), VfsError> {
        self.inner.rmdir(nodes, parent, name, op, path)
    }

    fn readdir(&self, nodes: &NodeTable, id: NodeId) -> Result<Vec<String>, VfsError> {
        self.inner.readdir(nodes, id)
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
        self.inner.symlink(nodes, parent, name, target, op, path)
    }

    fn readlink(&self, nodes: &NodeTable, id: NodeId) -> Result<String, VfsError> {
        self.inner.readlink(nodes, id)
    }

    fn read(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &mut [u8],
        position: u64,
    ) -> Result<usize, VfsError> {
        self.inner.read(nodes, stream, buf, position)
    }

    fn write(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &[u8],
        position: u64,
        can_own: bool,
    ) -> Result<usize, VfsError> {
        self.inner.write(nodes, stream, buf, position, can_own)
    }

    fn llseek(
        &mut self,
        nodes: &NodeTable,
        stream: &Stream,
        offset: i64,
        whence: u32,
    ) -> Result<u64, VfsError> {
        self.inner.llseek(nodes, stream, offset, whence)
    }

    fn allocate(
        &mut self,
        nodes: &mut NodeTable,
        stream: &Stream,
        offset: u64,
        length: u64,
    ) -> Result<(), VfsError> {
        self.inner.allocate(nodes, stream, offset, length)
    }

    fn mmap(
        &mut self,
        nodes: &mut NodeTable,
        heap: &mut LinearMemory,
        stream: &Stream,
        length: usize,
        prot: u32,
        flags: u32,
        position: u64,
    ) -> Result<MmapResult, VfsError> {
        self.inner
            .mmap(nodes, heap, stream, length, prot, flags, position)
    }

    fn msync(
        &mut self,
        nodes: &mut NodeTable,
        stream: &mut Stream,
        buf: &[u8],
        offset: u64,
        mmap_flags: u32,
    ) -> Result<(), VfsError> {
        self.inner.msync(nodes, stream, buf, offset, mmap_flags)
    }

    async fn syncfs(
        &mut self,
        nodes: &mut NodeTable,
        mountpoint: &str,
        root: NodeId,
        populate: bool,
    ) -> Result<(), SyncError> {
        let local = self.local_set(nodes, mountpoint, root);
        let remote: HashMap<String, i64> = self.store.keys().await?.into_iter().collect();

        let (src, dst) = if populate {
            (&remote, &local)
        } else {
            (&local, &remote)
        };

        let mut create: Vec<&String> = src
            .iter()
            .filter(|(key, timestamp)| match dst.get(*key) {
                Some(dst_timestamp) => *timestamp > dst_timestamp,
                None => true,
            })
            .map(|(key, _)| key)
            .collect();
        create.sort();

        let mut remove: Vec<&String> = dst
            .keys()
            .filter(|key| !src.contains_key(*key))
            .collect();
        remove.sort();
        remove.reverse();

        if create.is_empty() && remove.is_empty() {
            return Ok(());
        }
        log::debug!(
            "synchronizing '{}' ({}): {} to create, {} to remove",
            mountpoint,
            if populate { "populate" } else { "persist" },
            create.len(),
            remove.len()
        );

        let create: Vec<String> = create.into_iter().cloned().collect();
        let remove: Vec<String> = remove.into_iter().cloned().collect();
        if populate {
            for abs_path in &create {
                let entry = self.store.get(abs_path).await?.ok_or_else(|| {
                    StoreError::Entry(format!("{}: missing during sync", abs_path))
                })?;
                self.store_local(nodes, mountpoint, root, abs_path, entry)?;
            }
            for abs_path in &remove {
                self.remove_local(nodes, mountpoint, root, abs_path)?;
            }
        } else {
            for abs_path in &create {
                let entry = Self::load_local(nodes, mountpoint, root, abs_path)?;
                self.store.put(abs_path, entry).await?;
            }
            for abs_path in &remove {
                self.store.delete(abs_path).await?;
            }
            self.store.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::store::MemoryStore;
    use crate::fs::types::StreamCaps;

    fn setup() -> (DurableFs, NodeTable, NodeId) {
        let mut fs = DurableFs::new(Box::new(MemoryStore::new()));
        let mut nodes = NodeTable::new();
        let root = fs.mount(&mut nodes, MountId(0)).unwrap();
        (fs, nodes, root)
    }

    fn write_file(fs: &mut DurableFs, nodes: &mut NodeTable, parent: NodeId, name: &str, body: &[u8], ts: i64) -> NodeId {
        let abs = format!("/{}", name);
        let id = fs
            .mknod(nodes, parent, name, S_IFREG | 438, 0, "open", &abs)
            .unwrap();
        let mut stream = Stream::new(id, abs, 577, StreamCaps::WRITE);
        fs.write(nodes, &mut stream, body, 0, true).unwrap();
        fs.setattr(
            nodes,
            id,
            &AttrPatch {
                timestamp_ms: Some(ts),
                ..Default::default()
            },
        )
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_persist_pushes_tree_to_store() {
        let (mut fs, mut nodes, root) = setup();
        write_file(&mut fs, &mut nodes, root, "a.txt", b"alpha", 5);
        let dir = fs
            .mknod(&mut nodes, root, "d", S_IFDIR | 511, 0, "mkdir", "/d")
            .unwrap();
        let nested = fs
            .mknod(&mut nodes, dir, "b.txt", S_IFREG | 438, 0, "open", "/d/b.txt")
            .unwrap();
        let mut stream = Stream::new(nested, "/d/b.txt".to_string(), 577, StreamCaps::WRITE);
        fs.write(&mut nodes, &mut stream, b"beta", 0, true).unwrap();

        fs.syncfs(&mut nodes, "/", root, false).await.unwrap();

        let stored = fs.store_mut().get("/a.txt").await.unwrap().unwrap();
        assert_eq!(stored.contents.as_deref(), Some(b"alpha".as_slice()));
        assert_eq!(stored.timestamp_ms, 5);
        let stored_dir = fs.store_mut().get("/d").await.unwrap().unwrap();
        assert_eq!(stored_dir.contents, None);
        assert!(types::is_dir(stored_dir.mode));
        assert!(fs.store_mut().get("/d/b.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_newer_local_wins_on_persist() {
        let (mut fs, mut nodes, root) = setup();
        write_file(&mut fs, &mut nodes, root, "a", b"local", 5);
        fs.store_mut()
            .put(
                "/a",
                StoreEntry {
                    timestamp_ms: 3,
                    mode: S_IFREG | 438,
                    contents: Some(b"stale".to_vec()),
                },
            )
            .await
            .unwrap();
        fs.store_mut()
            .put(
                "/b",
                StoreEntry {
                    timestamp_ms: 9,
                    mode: S_IFREG | 438,
                    contents: Some(b"remote only".to_vec()),
                },
            )
            .await
            .unwrap();

        fs.syncfs(&mut nodes, "/", root, false).await.unwrap();

        // /a was newer locally and overwrote the store; /b had no local
        // counterpart and was removed.
        let stored = fs.store_mut().get("/a").await.unwrap().unwrap();
        assert_eq!(stored.contents.as_deref(), Some(b"local".as_slice()));
        assert!(fs.store_mut().get("/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_populate_keeps_newer_local_and_pulls_missing() {
        let (mut fs, mut nodes, root) = setup();
        write_file(&mut fs, &mut nodes, root, "a", b"local", 5);
        fs.store_mut()
            .put(
                "/a",
                StoreEntry {
                    timestamp_ms: 3,
                    mode: S_IFREG | 438,
                    contents: Some(b"stale".to_vec()),
                },
            )
            .await
            .unwrap();
        fs.store_mut()
            .put(
                "/b",
                StoreEntry {
                    timestamp_ms: 9,
                    mode: S_IFREG | 420,
                    contents: Some(b"pulled".to_vec()),
                },
            )
            .await
            .unwrap();

        fs.syncfs(&mut nodes, "/", root, true).await.unwrap();

        let a = nodes.probe(root, "a").unwrap();
        match &nodes.node(a).payload {
            NodePayload::File { contents, used } => assert_eq!(&contents[..*used], b"local"),
            _ => panic!("expected file"),
        }
        let b = nodes.probe(root, "b").unwrap();
        match &nodes.node(b).payload {
            NodePayload::File { contents, used } => assert_eq!(&contents[..*used], b"pulled"),
            _ => panic!("expected file"),
        }
        assert_eq!(nodes.node(b).timestamp_ms, 9);
        assert_eq!(nodes.node(b).mode & 4095, 420 & 4095);
    }

    #[tokio::test]
    async fn test_populate_removes_local_extras_children_first() {
        let (mut fs, mut nodes, root) = setup();
        let dir = fs
            .mknod(&mut nodes, root, "d", S_IFDIR | 511, 0, "mkdir", "/d")
            .unwrap();
        fs.mknod(&mut nodes, dir, "x", S_IFREG | 438, 0, "open", "/d/x")
            .unwrap();

        fs.syncfs(&mut nodes, "/", root, true).await.unwrap();

        assert_eq!(nodes.probe(root, "d"), None);
        assert_eq!(fs.readdir(&nodes, root).unwrap(), vec![".", ".."]);
    }

    #[tokio::test]
    async fn test_persist_stops_at_first_store_error() {
        let mut failing = MemoryStore::new();
        failing.fail_writes(true);
        let mut fs = DurableFs::new(Box::new(failing));
        let mut nodes = NodeTable::new();
        let root = fs.mount(&mut nodes, MountId(0)).unwrap();
        fs.mknod(&mut nodes, root, "a", S_IFREG | 438, 0, "open", "/a")
            .unwrap();
        let err = fs.syncfs(&mut nodes, "/", root, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[tokio::test]
    async fn test_populate_errors_when_remote_dir_is_newer_than_existing() {
        let (mut fs, mut nodes, root) = setup();
        let dir = fs
            .mknod(&mut nodes, root, "d", S_IFDIR | 511, 0, "mkdir", "/d")
            .unwrap();
        fs.setattr(
            &mut nodes,
            dir,
            &AttrPatch {
                timestamp_ms: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        fs.store_mut()
            .put(
                "/d",
                StoreEntry {
                    timestamp_ms: 10,
                    mode: S_IFDIR | 511,
                    contents: None,
                },
            )
            .await
            .unwrap();

        // The directory already exists locally, so re-creating it fails.
        let err = fs.syncfs(&mut nodes, "/", root, true).await.unwrap_err();
        match err {
            SyncError::Fs(fs_err) => assert_eq!(fs_err.errno(), libc::EEXIST),
            other => panic!("unexpected error: {}", other),
        }
    }
}
