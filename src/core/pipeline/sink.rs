//! Chunk sink: positional writes into the destination artifact.
//!
//! [`FileSink`] first claims the final path with an empty placeholder
//! created exclusively, so two transfers can never pick the same name.
//! Data goes into `<name>.peerdrop-tmp` next to it, pre-sized to the
//! declared total so any offset can be written in any order.
//! [`ChunkSink::finalize`] flushes and renames the temp file over the
//! placeholder; [`ChunkSink::abort`] deletes both.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::core::error::{TransferError, TransferResult};

const TEMP_SUFFIX: &str = ".peerdrop-tmp";

/// Numbered variants tried before giving up on a name.
const MAX_NAME_ATTEMPTS: u32 = 10_000;

#[async_trait]
pub trait ChunkSink: Send {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> TransferResult<()>;
    /// Commit the artifact. Returns where it ended up.
    async fn finalize(&mut self) -> TransferResult<PathBuf>;
    /// Discard whatever was written.
    async fn abort(&mut self);
}

/// Opens sinks for incoming transfers.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, file_name: &str, size: u64) -> TransferResult<Box<dyn ChunkSink>>;
}

/// Strip directories and reject names that cannot be a plain file name.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return None;
    }
    Some(base.to_string())
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, … inside `dir`.
fn candidate_paths<'a>(dir: &'a Path, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, format!(".{e}")),
        _ => (name, String::new()),
    };
    std::iter::once(dir.join(name)).chain(
        (1..MAX_NAME_ATTEMPTS).map(move |n| dir.join(format!("{stem} ({n}){ext}"))),
    )
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Create `path` only if nothing is there yet. `Ok(None)` when taken.
async fn create_exclusive(path: &Path) -> TransferResult<Option<fs::File>> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(TransferError::SinkOpen(format!("{}: {e}", path.display()))),
    }
}

pub struct FileSink {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    size: u64,
}

impl FileSink {
    /// Claim exactly `final_path`. Fails if it or its temp file exists.
    pub async fn create(final_path: PathBuf, size: u64) -> TransferResult<Self> {
        let display = final_path.display().to_string();
        Self::try_create(final_path, size)
            .await?
            .ok_or_else(|| TransferError::SinkOpen(format!("{display} already exists")))
    }

    /// Claim `final_path` and its temp file. `Ok(None)` if either is taken.
    async fn try_create(final_path: PathBuf, size: u64) -> TransferResult<Option<Self>> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::SinkOpen(format!("{}: {e}", parent.display())))?;
        }
        if create_exclusive(&final_path).await?.is_none() {
            return Ok(None);
        }
        let temp_path = temp_path_for(&final_path);
        let file = match create_exclusive(&temp_path).await {
            Ok(Some(file)) => file,
            other => {
                let _ = fs::remove_file(&final_path).await;
                return other.map(|_| None);
            }
        };
        let resized = file.set_len(size).await;
        let mut sink = Self {
            file: Some(file),
            temp_path,
            final_path,
            size,
        };
        if let Err(e) = resized {
            sink.abort().await;
            return Err(TransferError::SinkOpen(e.to_string()));
        }
        debug!(event = "sink_created", path = %sink.temp_path.display(), size);
        Ok(Some(sink))
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> TransferResult<()> {
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(TransferError::SinkWrite(format!(
                "write past end ({end} > {})",
                self.size
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TransferError::SinkWrite("sink already closed".into()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::SinkWrite(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| TransferError::SinkWrite(e.to_string()))?;
        Ok(())
    }

    async fn finalize(&mut self) -> TransferResult<PathBuf> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| TransferError::SinkWrite("sink already closed".into()))?;
        file.flush()
            .await
            .map_err(|e| TransferError::SinkWrite(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| TransferError::SinkWrite(e.to_string()))?;
        drop(file);
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| TransferError::SinkWrite(format!("rename: {e}")))?;
        info!(event = "file_saved", path = %self.final_path.display(), size = self.size);
        Ok(self.final_path.clone())
    }

    async fn abort(&mut self) {
        self.file.take();
        for path in [&self.temp_path, &self.final_path] {
            if let Err(e) = fs::remove_file(path).await {
                warn!(event = "sink_cleanup_failure", path = %path.display(), error = %e);
            }
        }
    }
}

/// Saves incoming files into one directory, never overwriting.
pub struct DirectorySinkFactory {
    dir: PathBuf,
}

impl DirectorySinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SinkFactory for DirectorySinkFactory {
    async fn open(&self, file_name: &str, size: u64) -> TransferResult<Box<dyn ChunkSink>> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| TransferError::SinkOpen(format!("invalid file name '{file_name}'")))?;
        for path in candidate_paths(&self.dir, &name) {
            if let Some(sink) = FileSink::try_create(path, size).await? {
                return Ok(Box::new(sink));
            }
        }
        Err(TransferError::SinkOpen(format!(
            "no free name for '{name}' in {}",
            self.dir.display()
        )))
    }
}
