use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use dropwire_protocol::{DEFAULT_CONTENT_TYPE, FileMetadata};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Number of chunks needed to cover `size` bytes: `ceil(size / chunk_size)`.
pub fn chunk_count(size: u64, chunk_size: usize) -> Result<u32, TransferError> {
    let chunk_size = chunk_size.max(1) as u64;
    let count = size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| {
        TransferError::InvalidConfig(format!(
            "{size} bytes needs {count} chunks of {chunk_size}; use a larger chunk size"
        ))
    })
}

// ---------------------------------------------------------------------------
// Byte sources
// ---------------------------------------------------------------------------

/// Random-access byte source a transfer reads chunks from.
pub trait ByteSource: Send {
    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `offset`.
    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError>;
}

/// In-memory source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > self.data.len() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(self.data[start..end].to_vec())
    }
}

/// A file on disk, read with seek + read for every range.
pub struct FileSource {
    file: std::fs::File,
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Opens `path` for ranged reads.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Builds the METADATA announcement for this file.
    pub fn metadata(&self, content_type: Option<&str>) -> Result<FileMetadata, TransferError> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::InvalidPath(format!("no file name in {}", self.path.display()))
            })?;

        let last_modified = self
            .file
            .metadata()?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(FileMetadata {
            name,
            size: self.size,
            content_type: content_type.unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
            last_modified,
        })
    }

}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    /// Blocking read. On a multi-thread runtime the worker is handed over
    /// with `block_in_place`; a current-thread runtime reads inline.
    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        let file = &mut self.file;
        let mut read = move || -> Result<Vec<u8>, TransferError> {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            Ok(buf)
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(read)
            }
            _ => read(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkPlanner
// ---------------------------------------------------------------------------

/// Splits a [`ByteSource`] into fixed-size indexed chunks.
///
/// Chunk `i` covers `[i*C, min((i+1)*C, S))`. Nothing is cached: every
/// call reads from the source again, which is what retransmission needs.
pub struct ChunkPlanner<S> {
    source: S,
    chunk_size: usize,
    size: u64,
    total_chunks: u32,
}

impl<S: ByteSource> ChunkPlanner<S> {
    /// Plans `source` in chunks of `chunk_size` bytes.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(source: S, chunk_size: usize) -> Result<Self, TransferError> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let size = source.size();
        let total_chunks = chunk_count(size, chunk_size)?;
        Ok(Self {
            source,
            chunk_size,
            size,
            total_chunks,
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total source size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Byte range covered by chunk `index`, or `None` past the end.
    pub fn range(&self, index: u32) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.size);
        Some(start..end)
    }

    /// Reads chunk `index` directly from the source.
    pub fn chunk(&mut self, index: u32) -> Result<Chunk, TransferError> {
        let range = self.range(index).ok_or(TransferError::ChunkOutOfRange {
            index,
            total: self.total_chunks,
        })?;
        let len = (range.end - range.start) as usize;
        let data = self.source.read_range(range.start, len)?;
        Ok(Chunk {
            index,
            total_chunks: self.total_chunks,
            payload: Bytes::from(data),
        })
    }

    /// Lazily yields chunks from `start` to the end.
    pub fn iter_from(&mut self, start: u32) -> Chunks<'_, S> {
        Chunks {
            planner: self,
            next: start,
        }
    }
}

/// Iterator returned by [`ChunkPlanner::iter_from`].
pub struct Chunks<'a, S> {
    planner: &'a mut ChunkPlanner<S>,
    next: u32,
}

impl<S: ByteSource> Iterator for Chunks<'_, S> {
    type Item = Result<Chunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.planner.total_chunks {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.planner.chunk(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.planner.total_chunks.saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}
