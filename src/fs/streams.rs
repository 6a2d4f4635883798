//! Open File Streams
//!
//! Descriptor table mapping small integers onto open streams. Descriptors
//! are handed out lowest-free-first and recycled as soon as they close.

use crate::errors::VfsError;
use crate::fs::node_table::NodeId;
use crate::fs::types::{self, StreamCaps};

/// Highest descriptor number the table hands out.
pub const MAX_OPEN_FDS: usize = 4096;

/// An open descriptor.
#[derive(Debug)]
pub struct Stream {
    pub fd: usize,
    pub node: NodeId,
    /// Absolute path the stream was opened at.
    pub path: String,
    pub flags: u32,
    pub position: u64,
    pub seekable: bool,
    /// Bytes pushed back in front of the read position.
    pub ungotten: Vec<u8>,
    pub error: bool,
    /// Cached directory listing for getdents, reset on rewind.
    pub getdents: Option<Vec<String>>,
    pub tty: bool,
    /// Device number for character-device streams.
    pub device: Option<u32>,
    pub caps: StreamCaps,
    /// Host file handle for streams backed by the real filesystem.
    pub host: Option<std::fs::File>,
}

impl Stream {
    pub fn new(node: NodeId, path: String, flags: u32, caps: StreamCaps) -> Self {
        Stream {
            fd: 0,
            node,
            path,
            flags,
            position: 0,
            seekable: caps.contains(StreamCaps::LLSEEK),
            ungotten: Vec::new(),
            error: false,
            getdents: None,
            tty: false,
            device: None,
            caps,
            host: None,
        }
    }

    pub fn is_read(&self) -> bool {
        types::stream_is_read(self.flags)
    }

    pub fn is_write(&self) -> bool {
        types::stream_is_write(self.flags)
    }

    pub fn is_append(&self) -> bool {
        types::stream_is_append(self.flags)
    }
}

pub struct StreamTable {
    streams: Vec<Option<Stream>>,
}

impl StreamTable {
    pub fn new() -> Self {
        let mut streams = Vec::with_capacity(MAX_OPEN_FDS + 1);
        streams.resize_with(MAX_OPEN_FDS + 1, || None);
        StreamTable { streams }
    }

    /// Install a stream at the lowest free descriptor at or above
    /// `fd_start`.
    pub fn alloc(&mut self, mut stream: Stream, fd_start: usize) -> Result<usize, VfsError> {
        for fd in fd_start..=MAX_OPEN_FDS {
            if self.streams[fd].is_none() {
                stream.fd = fd;
                self.streams[fd] = Some(stream);
                return Ok(fd);
            }
        }
        Err(VfsError::TooManyOpenFiles {
            operation: "open".to_string(),
        })
    }

    pub fn get(&self, fd: usize) -> Option<&Stream> {
        self.streams.get(fd).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut Stream> {
        self.streams.get_mut(fd).and_then(|slot| slot.as_mut())
    }

    /// Free the descriptor, returning the stream for teardown.
    pub fn take(&mut self, fd: usize) -> Option<Stream> {
        self.streams.get_mut(fd).and_then(|slot| slot.take())
    }

    pub fn is_open(&self, fd: usize) -> bool {
        self.get(fd).is_some()
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}
