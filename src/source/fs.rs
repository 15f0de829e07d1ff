use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

use crate::config::SourceConfig;
use crate::error::DocError;
use crate::source::network_utils::{create_response_status_error, is_pdf_file};
use crate::source::{ByteReader, ByteSource, FullReader, ProgressCallback, ProgressSlot, ReaderSet};

/// Bytes from the local filesystem. Ranges are native here, so the full reader supports them
///  unless they are disabled in the config.
pub struct FileByteSource {
    path: PathBuf,
    config: SourceConfig,
    readers: ReaderSet,
}

impl FileByteSource {
    pub fn new(path: impl Into<PathBuf>, config: SourceConfig) -> anyhow::Result<FileByteSource> {
        config.validate()?;
        Ok(FileByteSource {
            path: path.into(),
            config,
            readers: ReaderSet::default(),
        })
    }
}

impl ByteSource for FileByteSource {
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>> {
        self.readers.claim_full_reader(|| Arc::new(FsFullReader {
            file: FsFile::new(self.path.clone(), 0, None, self.config.range_chunk_size),
            config: self.config.clone(),
            length: OnceCell::new(),
            loaded: self.readers.progressive_counter(),
            progress: ProgressSlot::default(),
        }))
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>> {
        if begin >= end || self.readers.is_already_delivered(end) {
            return None;
        }
        trace!(begin, end, path = ?self.path, "range reader");
        Some(self.readers.add_range_reader(Arc::new(FsRangeReader {
            file: FsFile::new(self.path.clone(), begin, Some(end), self.config.range_chunk_size),
            loaded: AtomicU64::new(0),
            progress: ProgressSlot::default(),
        })))
    }

    fn progressive_data_length(&self) -> u64 {
        self.readers.progressive_data_length()
    }

    fn cancel_all_requests(&self, reason: DocError) {
        self.readers.cancel_all(reason);
    }
}

fn file_error(path: &Path, e: std::io::Error) -> DocError {
    if e.kind() == std::io::ErrorKind::NotFound {
        create_response_status_error(0, &format!("file://{}", path.display()))
    }
    else {
        DocError::unknown(format!("error reading {}", path.display()), e.to_string())
    }
}

/// An open file positioned in `[begin, end)`, opened lazily on first use
struct FsFile {
    path: PathBuf,
    begin: u64,
    end: Option<u64>,
    chunk_size: u64,
    file: Mutex<Option<(File, u64)>>,
    opened: OnceCell<Result<u64, DocError>>,
    cancelled: AtomicBool,
}

impl FsFile {
    fn new(path: PathBuf, begin: u64, end: Option<u64>, chunk_size: u64) -> FsFile {
        FsFile {
            path,
            begin,
            end,
            chunk_size,
            file: Mutex::new(None),
            opened: OnceCell::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// opens the file and returns its length
    async fn open(&self) -> Result<u64, DocError> {
        self.opened.get_or_init(|| self.open_file()).await.clone()
    }

    async fn open_file(&self) -> Result<u64, DocError> {
        let mut file = File::open(&self.path).await
            .map_err(|e| file_error(&self.path, e))?;
        let metadata = file.metadata().await
            .map_err(|e| file_error(&self.path, e))?;
        if !metadata.is_file() {
            return Err(create_response_status_error(0, &format!("file://{}", self.path.display())));
        }
        if self.begin > 0 {
            file.seek(SeekFrom::Start(self.begin)).await
                .map_err(|e| file_error(&self.path, e))?;
        }

        debug!(path = ?self.path, len = metadata.len(), "opened file");
        *self.file.lock().await = Some((file, self.begin));
        Ok(metadata.len())
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, DocError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        let length = self.open().await?;

        let mut guard = self.file.lock().await;
        let Some((file, position)) = guard.as_mut() else {
            return Ok(None);
        };

        let end = self.end.map_or(length, |end| end.min(length));
        let want = self.chunk_size.min(end.saturating_sub(*position));
        if want == 0 {
            *guard = None;
            return Ok(None);
        }

        // NB: bounded by the file's remaining length, not only by the configured chunk size
        let mut buf = BytesMut::with_capacity(usize::try_from(want).unwrap_or(usize::MAX));
        let n = file.read_buf(&mut buf).await
            .map_err(|e| file_error(&self.path, e))?;
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            *guard = None;
            return Ok(None);
        }
        *position += n as u64;
        Ok(Some(buf.freeze()))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // a read in progress holds the lock - it sees the flag when it is done
        if let Ok(mut file) = self.file.try_lock() {
            *file = None;
        }
    }
}

struct FsFullReader {
    file: FsFile,
    config: SourceConfig,
    length: OnceCell<u64>,
    loaded: Arc<AtomicU64>,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for FsFullReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.file.read_chunk().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, self.content_length());
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        debug!(path = ?self.file.path, %reason, "cancelling full reader");
        self.file.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}

#[async_trait]
impl FullReader for FsFullReader {
    async fn headers_ready(&self) -> Result<(), DocError> {
        let length = self.file.open().await?;
        let _ = self.length.set(length);
        Ok(())
    }

    fn content_length(&self) -> Option<u64> {
        self.length.get().copied().or(self.config.content_length)
    }

    fn is_range_supported(&self) -> bool {
        self.length.initialized() && !self.config.disable_range
    }

    fn is_streaming_supported(&self) -> bool {
        !self.config.disable_stream
    }

    fn filename(&self) -> Option<String> {
        let name = self.file.path.file_name()?.to_str()?;
        is_pdf_file(name).then(|| name.to_string())
    }
}

struct FsRangeReader {
    file: FsFile,
    loaded: AtomicU64,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for FsRangeReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.file.read_chunk().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, None);
        }
        Ok(chunk)
    }

    fn cancel(&self, _reason: DocError) {
        self.file.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}
