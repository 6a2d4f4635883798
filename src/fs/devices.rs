//! Character Devices
//!
//! Device drivers keyed by device number. A driver supplies the stream
//! capabilities for descriptors opened on its nodes and handles the byte
//! traffic itself; the node table only records the device number.

use std::collections::HashMap;

use crate::errors::VfsError;
use crate::fs::streams::Stream;
use crate::fs::types::StreamCaps;

pub trait DeviceDriver: Send {
    /// Stream capabilities of descriptors opened on this device. None of
    /// the built-in devices are seekable.
    fn stream_caps(&self) -> StreamCaps {
        StreamCaps::READ | StreamCaps::WRITE
    }

    /// Hook run when a descriptor opens the device.
    fn open(&mut self, _stream: &mut Stream) -> Result<(), VfsError> {
        Ok(())
    }

    fn read(&mut self, stream: &mut Stream, buf: &mut [u8]) -> Result<usize, VfsError>;

    fn write(&mut self, stream: &mut Stream, buf: &[u8]) -> Result<usize, VfsError>;

    /// Flush any buffered output.
    fn fsync(&mut self) {}
}

pub struct DeviceRegistry {
    drivers: HashMap<u32, Box<dyn DeviceDriver>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, dev: u32, driver: Box<dyn DeviceDriver>) {
        self.drivers.insert(dev, driver);
    }

    pub fn get_mut(&mut self, dev: u32) -> Option<&mut Box<dyn DeviceDriver>> {
        self.drivers.get_mut(&dev)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in devices
// ============================================================================

/// /dev/null: reads hit end of file, writes are swallowed whole.
pub struct NullDevice;

impl DeviceDriver for NullDevice {
    fn read(&mut self, _stream: &mut Stream, _buf: &mut [u8]) -> Result<usize, VfsError> {
        Ok(0)
    }

    fn write(&mut self, _stream: &mut Stream, buf: &[u8]) -> Result<usize, VfsError> {
        Ok(buf.len())
    }
}

/// /dev/random and /dev/urandom: an endless byte source.
pub struct RandomDevice;

impl DeviceDriver for RandomDevice {
    fn stream_caps(&self) -> StreamCaps {
        StreamCaps::READ
    }

    fn read(&mut self, _stream: &mut Stream, buf: &mut [u8]) -> Result<usize, VfsError> {
        for byte in buf.iter_mut() {
            *byte = rand::random::<u8>();
        }
        Ok(buf.len())
    }

    fn write(&mut self, stream: &mut Stream, _buf: &[u8]) -> Result<usize, VfsError> {
        Err(VfsError::invalid_argument("write", &stream.path))
    }
}

/// Sink receiving terminal output one line at a time.
pub type ConsoleSink = Box<dyn FnMut(&str) + Send>;

/// Terminal device. Output is line buffered into the sink; input is served
/// from a queue that callers feed.
pub struct ConsoleDevice {
    input: std::collections::VecDeque<u8>,
    buffer: Vec<u8>,
    sink: ConsoleSink,
}

impl ConsoleDevice {
    pub fn new(sink: ConsoleSink) -> Self {
        ConsoleDevice {
            input: std::collections::VecDeque::new(),
            buffer: Vec::new(),
            sink,
        }
    }

    /// Terminal whose lines go to the host log at info level.
    pub fn to_log() -> Self {
        Self::new(Box::new(|line| log::info!("{}", line)))
    }

    /// Terminal whose lines go to the host log at warn level, for the
    /// error stream.
    pub fn to_error_log() -> Self {
        Self::new(Box::new(|line| log::warn!("{}", line)))
    }

    /// Queue bytes for subsequent reads.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    fn put_char(&mut self, byte: u8) {
        if byte == b'\n' {
            self.flush_line();
        } else if byte != 0 {
            self.buffer.push(byte);
        }
    }

    fn flush_line(&mut self) {
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        (self.sink)(&line);
        self.buffer.clear();
    }
}

impl DeviceDriver for ConsoleDevice {
    fn open(&mut self, stream: &mut Stream) -> Result<(), VfsError> {
        stream.tty = true;
        Ok(())
    }

    fn read(&mut self, _stream: &mut Stream, buf: &mut [u8]) -> Result<usize, VfsError> {
        if self.input.is_empty() {
            return Err(VfsError::WouldBlock {
                operation: "read".to_string(),
            });
        }
        let mut read = 0;
        while read < buf.len() {
            match self.input.pop_front() {
                Some(byte) => {
                    buf[read] = byte;
                    read += 1;
                }
                None => break,
            }
        }
        Ok(read)
    }

    fn write(&mut self, _stream: &mut Stream, buf: &[u8]) -> Result<usize, VfsError> {
        for &byte in buf {
            self.put_char(byte);
        }
        Ok(buf.len())
    }

    fn fsync(&mut self) {
        if !self.buffer.is_empty() {
            self.flush_line();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::node_table::NodeId;
    use std::sync::{Arc, Mutex};

    fn stream() -> Stream {
        Stream::new(NodeId(1), "/dev/x".to_string(), 0, StreamCaps::empty())
    }

    #[test]
    fn test_null_device() {
        let mut dev = NullDevice;
        let mut buf = [7u8; 4];
        assert_eq!(dev.read(&mut stream(), &mut buf).unwrap(), 0);
        assert_eq!(buf, [7, 7, 7, 7]);
        assert_eq!(dev.write(&mut stream(), b"drop me").unwrap(), 7);
    }

    #[test]
    fn test_random_device_fills_buffer() {
        let mut dev = RandomDevice;
        let mut buf = [0u8; 64];
        assert_eq!(dev.read(&mut stream(), &mut buf).unwrap(), 64);
        let err = dev.write(&mut stream(), b"x").unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_console_line_buffering() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = lines.clone();
        let mut dev = ConsoleDevice::new(Box::new(move |line| {
            sink_lines.lock().unwrap().push(line.to_string());
        }));

        dev.write(&mut stream(), b"hello ").unwrap();
        assert!(lines.lock().unwrap().is_empty());
        dev.write(&mut stream(), b"world\npartial").unwrap();
        assert_eq!(lines.lock().unwrap().as_slice(), ["hello world"]);
        dev.fsync();
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["hello world", "partial"]
        );
    }

    #[test]
    fn test_console_read_queue() {
        let mut dev = ConsoleDevice::new(Box::new(|_| {}));
        let mut buf = [0u8; 3];
        let err = dev.read(&mut stream(), &mut buf).unwrap_err();
        assert_eq!(err.errno(), libc::EAGAIN);

        dev.push_input(b"abcd");
        assert_eq!(dev.read(&mut stream(), &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(dev.read(&mut stream(), &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'd');
    }

    #[test]
    fn test_console_open_marks_tty() {
        let mut dev = ConsoleDevice::new(Box::new(|_| {}));
        let mut s = stream();
        dev.open(&mut s).unwrap();
        assert!(s.tty);
    }
}
