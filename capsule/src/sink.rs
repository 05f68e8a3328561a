//! Output sinks for process stdout and stderr.
//!
//! A [`Writer`] receives every chunk of one stream in order. Writers are
//! driven from a blocking thread, so a `write` that blocks simply applies
//! backpressure to its own stream.

use std::fs::File;
use std::io::Write as _;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SinkError;

/// Destination for one output stream of a process.
pub trait Writer: Send + 'static {
    /// Consume one chunk. Zero-length writes are no-ops.
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// Called once after the last chunk.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl Writer for Box<dyn Writer> {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        (**self).write(data)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct Buffer {
    data: Vec<u8>,
    closed: bool,
}

/// Accumulates everything written. Clones share the same buffer, so keep
/// one clone to read the output after handing the other to a process.
#[derive(Clone, Default)]
pub struct BufferWriter {
    inner: Arc<Mutex<Buffer>>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far.
    pub fn data(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    /// The bytes written so far, lossily decoded as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().data).into_owned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the stream has ended.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Writer for BufferWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.lock().data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// In-memory sink that refuses to grow past `capacity` bytes.
///
/// A chunk that would overflow is rejected whole; the stream's pump then
/// stops delivering and records the error on the process.
#[derive(Clone)]
pub struct BoundedWriter {
    buffer: BufferWriter,
    capacity: usize,
}

impl BoundedWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BufferWriter::new(),
            capacity,
        }
    }

    /// Shared view of the accepted bytes.
    pub fn buffer(&self) -> BufferWriter {
        self.buffer.clone()
    }
}

impl Writer for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.buffer.inner.lock();
        if inner.data.len() + data.len() > self.capacity {
            return Err(SinkError::Full {
                capacity: self.capacity,
            });
        }
        inner.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.buffer.close()
    }
}

// ============================================================================
// Files and pipes
// ============================================================================

/// Writes to a file, pipe or any other descriptor.
pub struct FileWriter {
    file: File,
}

impl FileWriter {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Create (or truncate) a file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Ok(Self::new(File::create(path)?))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::new(File::from(fd))
    }
}

impl Writer for FileWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;
        Ok(())
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardWriter;

impl Writer for DiscardWriter {
    fn write(&mut self, _data: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_writer_shares_data_between_clones() {
        let reader = BufferWriter::new();
        let mut writer = reader.clone();
        writer.write(b"hello ").unwrap();
        writer.write(b"").unwrap();
        writer.write(b"world").unwrap();
        assert!(!reader.is_closed());
        writer.close().unwrap();

        assert_eq!(reader.contents(), "hello world");
        assert!(reader.is_closed());
    }

    #[test]
    fn test_bounded_writer_rejects_overflow() {
        let mut writer = BoundedWriter::new(8);
        let view = writer.buffer();
        writer.write(b"12345").unwrap();
        assert_eq!(
            writer.write(b"6789").unwrap_err(),
            SinkError::Full { capacity: 8 }
        );
        writer.write(b"678").unwrap();
        assert_eq!(view.data(), b"12345678");
    }

    #[test]
    fn test_file_writer_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut writer = FileWriter::create(&path).unwrap();
        writer.write(b"line one\n").unwrap();
        writer.write(b"line two\n").unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_discard_writer_accepts_anything() {
        let mut writer = DiscardWriter;
        writer.write(&[0u8; 4096]).unwrap();
        writer.close().unwrap();
    }
}
