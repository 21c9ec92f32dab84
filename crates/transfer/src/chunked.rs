use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::trace;
use vaultpush_protocol::ByteRange;

use crate::TransferError;

// ---------------------------------------------------------------------------
// PartReader
// ---------------------------------------------------------------------------

/// Reads exact byte ranges from an archive source.
///
/// The reader never trusts its own idea of where the cursor is: every read
/// checks the stream position and seeks back to the requested offset if it
/// has drifted, so a retried part always reads the same bytes.
pub struct PartReader<R> {
    inner: R,
    len: u64,
}

impl PartReader<File> {
    /// Opens `path` for part reading.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl<R: Read + Seek> PartReader<R> {
    /// Wraps a seekable source, measuring its length.
    pub fn new(mut inner: R) -> Result<Self, TransferError> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len })
    }

    /// Source length in bytes, measured when the reader was created.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current cursor position as reported by the underlying stream.
    pub fn position(&mut self) -> Result<u64, TransferError> {
        Ok(self.inner.stream_position()?)
    }

    /// Moves the cursor to `offset` unless it is already there.
    pub fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        let actual = self.inner.stream_position()?;
        if actual != offset {
            trace!(from = actual, to = offset, "repositioning source cursor");
            self.inner.seek(SeekFrom::Start(offset))?;
        }
        Ok(())
    }

    /// Reads exactly `range.length` bytes starting at `range.start`.
    pub fn read_range(&mut self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        let short = TransferError::ShortRead {
            offset: range.start,
            expected: range.length,
        };
        if range.end() > self.len {
            return Err(short);
        }

        self.seek_to(range.start)?;
        let mut buf = vec![0u8; range.length as usize];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(short),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
