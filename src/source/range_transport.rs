use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::SourceConfig;
use crate::error::DocError;
use crate::source::network_utils::is_pdf_file;
use crate::source::{ByteReader, ByteSource, ChunkQueue, FullReader, ProgressCallback, ProgressSlot, ReaderSet};

/// What the embedding application knows up front
#[derive(Debug, Clone, Default)]
pub struct RangeTransportInit {
    pub length: Option<u64>,
    /// the first bytes of the document, if the application already has them
    pub initial_data: Option<Bytes>,
    /// `true` if no more progressive data will be pushed
    pub progressive_done: bool,
    pub content_disposition_filename: Option<String>,
}

/// The embedding application's side of a [RangeTransportSource]. It answers
///  [RangeTransportHost::request_data_range] by calling [RangeTransportSource::on_data_range].
#[cfg_attr(test, mockall::automock)]
pub trait RangeTransportHost: Send + Sync {
    /// called once the source is ready to receive data
    fn transport_ready(&self);

    fn request_data_range(&self, begin: u64, end: u64);

    /// called when all requests are cancelled
    fn abort(&self);
}

struct PushState {
    /// progressive chunks pushed before the full reader was requested
    queued: Vec<Bytes>,
    full_reader: Option<Arc<PushFullReader>>,
    range_readers: Vec<(u64, Arc<PushRangeReader>)>,
    progressive_done: bool,
}

/// A byte source for data an embedding application pushes: progressive chunks in order, and
///  the responses to range requests it was asked for.
pub struct RangeTransportSource {
    host: Arc<dyn RangeTransportHost>,
    config: SourceConfig,
    length: Option<u64>,
    filename: Option<String>,
    readers: ReaderSet,
    state: Mutex<PushState>,
}

impl RangeTransportSource {
    pub fn new(init: RangeTransportInit, host: Arc<dyn RangeTransportHost>, config: SourceConfig) -> anyhow::Result<RangeTransportSource> {
        config.validate()?;

        let queued = init.initial_data
            .filter(|data| !data.is_empty())
            .into_iter()
            .collect();

        let source = RangeTransportSource {
            host,
            length: init.length.or(config.content_length),
            config,
            filename: init.content_disposition_filename,
            readers: ReaderSet::default(),
            state: Mutex::new(PushState {
                queued,
                full_reader: None,
                range_readers: Vec::new(),
                progressive_done: init.progressive_done,
            }),
        };
        source.host.transport_ready();
        Ok(source)
    }

    fn state(&self) -> MutexGuard<'_, PushState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_progressive_data(&self, chunk: Bytes) {
        let mut state = self.state();
        match &state.full_reader {
            Some(reader) => reader.enqueue(chunk),
            None => state.queued.push(chunk),
        }
    }

    /// Data for a range request. There must be a range reader that asked for data at `begin`.
    pub fn on_data_range(&self, begin: u64, chunk: Bytes) -> anyhow::Result<()> {
        let reader = {
            let mut state = self.state();
            let Some(idx) = state.range_readers.iter().position(|(b, _)| *b == begin) else {
                bail!("no range reader is waiting for data at {}", begin);
            };
            state.range_readers.remove(idx).1
        };
        trace!(begin, len = chunk.len(), "range data");
        reader.queue.push(chunk);
        reader.queue.finish();
        Ok(())
    }

    pub fn on_progress(&self, loaded: u64, total: Option<u64>) {
        if total.is_none() {
            return;
        }
        let reader = self.state().full_reader.clone();
        if let Some(reader) = reader {
            reader.progress.report(loaded, total);
        }
    }

    pub fn on_progressive_done(&self) {
        let mut state = self.state();
        state.progressive_done = true;
        if let Some(reader) = &state.full_reader {
            reader.queue.finish();
        }
    }
}

impl ByteSource for RangeTransportSource {
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>> {
        self.readers.claim_full_reader(|| {
            let mut state = self.state();
            let reader = Arc::new(PushFullReader {
                queue: ChunkQueue::default(),
                loaded: self.readers.progressive_counter(),
                length: self.length,
                filename: self.filename.clone().filter(|f| is_pdf_file(f)),
                config: self.config.clone(),
                progress: ProgressSlot::default(),
            });
            for chunk in std::mem::take(&mut state.queued) {
                reader.enqueue(chunk);
            }
            if state.progressive_done {
                reader.queue.finish();
            }
            state.full_reader = Some(reader.clone());
            reader
        })
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>> {
        if begin >= end || self.readers.is_already_delivered(end) {
            return None;
        }

        let reader = Arc::new(PushRangeReader {
            queue: ChunkQueue::default(),
            progress: ProgressSlot::default(),
        });
        {
            let mut state = self.state();
            state.range_readers.retain(|(_, r)| !r.queue.is_ended());
            state.range_readers.push((begin, reader.clone()));
        }

        trace!(begin, end, "requesting data range from host");
        self.host.request_data_range(begin, end);
        Some(self.readers.add_range_reader(reader))
    }

    fn progressive_data_length(&self) -> u64 {
        self.readers.progressive_data_length()
    }

    fn cancel_all_requests(&self, reason: DocError) {
        self.readers.cancel_all(reason);
        self.state().range_readers.clear();
        self.host.abort();
    }
}

struct PushFullReader {
    queue: ChunkQueue,
    loaded: Arc<AtomicU64>,
    length: Option<u64>,
    filename: Option<String>,
    config: SourceConfig,
    progress: ProgressSlot,
}

impl PushFullReader {
    fn enqueue(&self, chunk: Bytes) {
        let len = chunk.len() as u64;
        if self.queue.push(chunk) {
            self.loaded.fetch_add(len, Ordering::AcqRel);
        }
    }
}

#[async_trait]
impl ByteReader for PushFullReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        self.queue.next().await
    }

    fn cancel(&self, reason: DocError) {
        debug!(%reason, "cancelling pushed full reader");
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}

#[async_trait]
impl FullReader for PushFullReader {
    async fn headers_ready(&self) -> Result<(), DocError> {
        Ok(())
    }

    fn content_length(&self) -> Option<u64> {
        self.length
    }

    fn is_range_supported(&self) -> bool {
        !self.config.disable_range
    }

    fn is_streaming_supported(&self) -> bool {
        !self.config.disable_stream
    }

    fn filename(&self) -> Option<String> {
        self.filename.clone()
    }
}

/// answered by a single chunk
struct PushRangeReader {
    queue: ChunkQueue,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for PushRangeReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.queue.next().await?;
        if let Some(chunk) = &chunk {
            self.progress.report(chunk.len() as u64, None);
        }
        Ok(chunk)
    }

    fn cancel(&self, _reason: DocError) {
        self.queue.cancel();
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}
