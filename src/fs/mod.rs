//! File System Module
//!
//! The virtual filesystem: a node arena indexed by a name hash, stackable
//! mounts, character devices and descriptor-based streams, all reached
//! through the `Vfs` context value.

pub mod devices;
pub mod mount;
pub mod node_table;
pub mod streams;
pub mod types;
pub mod vfs;

pub use devices::{ConsoleDevice, ConsoleSink, DeviceDriver, DeviceRegistry, NullDevice, RandomDevice};
pub use mount::{Mount, MountId, MountTable};
pub use node_table::{Node, NodeId, NodePayload, NodeTable};
pub use streams::{Stream, StreamTable, MAX_OPEN_FDS};
pub use types::{AttrPatch, FileAttr, MmapResult, NodeCaps, StreamCaps};
pub use vfs::{Lookup, LookupOptions, PathInfo, TrackingDelegate, Vfs, TRACK_READ, TRACK_WRITE};
