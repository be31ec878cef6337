//! Chunk source: byte-range reads of the file being sent, plus a prefetching
//! reader task that keeps the send loop fed while it waits on backpressure.
//!
//! ```text
//! ┌─────────────┐   bounded chan   ┌───────────┐
//! │ ChunkSource │ ────────────────►│ send loop │──► channel pool
//! │ (reader)    │  READ_AHEAD cap  └───────────┘
//! └─────────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, Mutex};

use crate::core::config::SENDER_READ_AHEAD_CHUNKS;
use crate::core::error::{TransferError, TransferResult};

#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn size(&self) -> u64;
    /// Read exactly `len` bytes at `offset`.
    async fn read(&self, offset: u64, len: usize) -> TransferResult<Bytes>;
}

/// Reads slices of a file on disk.
pub struct FileChunkSource {
    path: PathBuf,
    size: u64,
    file: Mutex<tokio::fs::File>,
}

impl FileChunkSource {
    pub async fn open(path: &Path) -> TransferResult<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::Source(format!("{}: {e}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileChunkSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read(&self, offset: u64, len: usize) -> TransferResult<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| TransferError::Source(e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

/// A slice of the source, ready to frame and send.
#[derive(Debug)]
pub struct ReadChunk {
    /// 0-based chunk index; selects the channel.
    pub index: u64,
    pub offset: u64,
    pub data: Bytes,
}

pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}

/// Spawn a task that reads the whole source in `chunk_size` slices into a
/// bounded channel. The task stops at the first read error (delivered as
/// the last item) or when the receiver is dropped.
pub fn spawn_reader(
    source: Arc<dyn ChunkSource>,
    chunk_size: usize,
) -> (
    mpsc::Receiver<TransferResult<ReadChunk>>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);
    let size = source.size();
    let total = chunk_count(size, chunk_size);

    let handle = tokio::spawn(async move {
        for index in 0..total {
            let offset = index * chunk_size as u64;
            let len = (chunk_size as u64).min(size - offset) as usize;
            let item = source
                .read(offset, len)
                .await
                .map(|data| ReadChunk {
                    index,
                    offset,
                    data,
                });
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    (rx, handle)
}
