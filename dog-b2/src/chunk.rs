use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{B2Error, B2Result};

/// Stream of bytes for upload content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Hex-encoded SHA1, the checksum B2 expects
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Where upload content comes from
pub enum UploadSource {
    /// In-memory buffer
    Bytes(Bytes),
    /// Local file, re-readable at any offset
    File(PathBuf),
    /// Forward-only stream; parts cannot be re-read after a failure
    Stream {
        stream: ByteStream,
        size_hint: Option<u64>,
    },
}

impl UploadSource {
    pub fn bytes<B: Into<Bytes>>(data: B) -> Self {
        Self::Bytes(data.into())
    }

    pub fn path<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(path.into())
    }

    pub fn stream(stream: ByteStream) -> Self {
        Self::Stream {
            stream,
            size_hint: None,
        }
    }

    pub fn stream_with_size(stream: ByteStream, size: u64) -> Self {
        Self::Stream {
            stream,
            size_hint: Some(size),
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(data) => write!(f, "UploadSource::Bytes({} bytes)", data.len()),
            Self::File(path) => write!(f, "UploadSource::File({})", path.display()),
            Self::Stream { size_hint, .. } => write!(f, "UploadSource::Stream({:?})", size_hint),
        }
    }
}

/// One fixed-size slice of the source and its checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Zero-based position in the sequence
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub payload: Bytes,
    pub content_sha1: String,
}

impl ChunkDescriptor {
    fn new(index: u32, offset: u64, payload: Bytes) -> Self {
        Self {
            index,
            offset,
            length: payload.len() as u64,
            content_sha1: sha1_hex(&payload),
            payload,
        }
    }

    /// B2 part numbers start at 1
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }
}

enum Reader {
    Memory(Bytes),
    File {
        file: tokio::fs::File,
        size: u64,
    },
    Stream {
        stream: ByteStream,
        buffer: BytesMut,
        finished: bool,
        size_hint: Option<u64>,
    },
}

/// Lazily cuts a source into `chunk_size` pieces.
///
/// Every chunk is exactly `chunk_size` bytes except possibly the last.
/// Seekable sources can re-derive any chunk by offset.
pub struct ChunkReader {
    reader: Reader,
    chunk_size: u64,
    next_offset: u64,
    next_index: u32,
}

impl ChunkReader {
    pub async fn open(source: UploadSource, chunk_size: u64) -> B2Result<Self> {
        if chunk_size == 0 {
            return Err(B2Error::invalid_config("chunk_size must be positive"));
        }

        let reader = match source {
            UploadSource::Bytes(data) => Reader::Memory(data),
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                Reader::File { file, size }
            }
            UploadSource::Stream { stream, size_hint } => Reader::Stream {
                stream,
                buffer: BytesMut::new(),
                finished: false,
                size_hint,
            },
        };

        Ok(Self {
            reader,
            chunk_size,
            next_offset: 0,
            next_index: 0,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Total size, when known up front
    pub fn size(&self) -> Option<u64> {
        match &self.reader {
            Reader::Memory(data) => Some(data.len() as u64),
            Reader::File { size, .. } => Some(*size),
            Reader::Stream { size_hint, .. } => *size_hint,
        }
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self.reader, Reader::Stream { .. })
    }

    /// Offset of the next chunk `next` will produce
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Produce the next chunk, or `None` at the end of the source
    pub async fn next(&mut self) -> B2Result<Option<ChunkDescriptor>> {
        let offset = self.next_offset;
        let payload = match self.read_at(offset).await? {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let chunk = ChunkDescriptor::new(self.next_index, offset, payload);
        self.next_offset += chunk.length;
        self.next_index += 1;
        Ok(Some(chunk))
    }

    /// Re-derive the chunk starting at `offset` without moving the cursor
    pub async fn chunk_at(&mut self, offset: u64) -> B2Result<ChunkDescriptor> {
        if !self.is_seekable() || offset % self.chunk_size != 0 {
            return Err(B2Error::NonResumableSource { offset });
        }

        let index = (offset / self.chunk_size) as u32;
        match self.read_at(offset).await? {
            Some(payload) => Ok(ChunkDescriptor::new(index, offset, payload)),
            None => Err(B2Error::NonResumableSource { offset }),
        }
    }

    /// True when at most `limit` bytes remain to be produced.
    ///
    /// Streams buffer up to `limit + 1` bytes to find out; the buffered
    /// bytes are still handed out by `next`.
    pub async fn ends_within(&mut self, limit: u64) -> B2Result<bool> {
        let next_offset = self.next_offset;
        match &mut self.reader {
            Reader::Memory(data) => Ok((data.len() as u64).saturating_sub(next_offset) <= limit),
            Reader::File { size, .. } => Ok(size.saturating_sub(next_offset) <= limit),
            Reader::Stream {
                stream,
                buffer,
                finished,
                ..
            } => {
                let want = usize::try_from(limit).unwrap_or(usize::MAX).saturating_add(1);
                fill(stream, buffer, finished, want).await?;
                Ok(buffer.len() as u64 <= limit)
            }
        }
    }

    /// Everything not yet produced, as one buffer
    pub async fn read_to_end(&mut self) -> B2Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await? {
            out.extend_from_slice(&chunk.payload);
        }
        Ok(out.freeze())
    }

    async fn read_at(&mut self, offset: u64) -> B2Result<Option<Bytes>> {
        let chunk_size = self.chunk_size;
        let next_offset = self.next_offset;
        match &mut self.reader {
            Reader::Memory(data) => {
                let len = data.len() as u64;
                if offset >= len {
                    return Ok(None);
                }
                let end = (offset + chunk_size).min(len);
                Ok(Some(data.slice(offset as usize..end as usize)))
            }
            Reader::File { file, size } => {
                if offset >= *size {
                    return Ok(None);
                }
                let len = chunk_size.min(*size - offset) as usize;
                let mut payload = vec![0u8; len];
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut payload).await?;
                Ok(Some(Bytes::from(payload)))
            }
            Reader::Stream {
                stream,
                buffer,
                finished,
                ..
            } => {
                if offset != next_offset {
                    return Err(B2Error::NonResumableSource { offset });
                }
                fill(stream, buffer, finished, chunk_size as usize).await?;
                if buffer.is_empty() {
                    return Ok(None);
                }
                let take = buffer.len().min(chunk_size as usize);
                Ok(Some(buffer.split_to(take).freeze()))
            }
        }
    }
}

/// Pull from the stream until `want` bytes are buffered or it ends
async fn fill(stream: &mut ByteStream, buffer: &mut BytesMut, finished: &mut bool, want: usize) -> B2Result<()> {
    while buffer.len() < want && !*finished {
        match stream.next().await {
            Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
            Some(Err(err)) => return Err(err.into()),
            None => *finished = true,
        }
    }
    Ok(())
}
