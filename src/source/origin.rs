use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, RANGE};
use hyper::HeaderMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::SourceConfig;
use crate::error::DocError;
use crate::source::network_utils::{create_headers, create_response_status_error, extract_filename_from_header, validate_range_request_capabilities, validate_response_status, OriginKind};
use crate::source::{ByteReader, ByteSource, ChunkQueue, FullReader, ProgressCallback, ProgressSlot, ReaderSet};
use crate::util::latch::Latch;

#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// `[begin, end)`, also present as a `Range` header for http origins
    pub range: Option<(u64, u64)>,
}

/// What a host client reports for a request, in this order: headers once, any number of chunks,
///  then either `End` or `Error`.
#[derive(Debug)]
pub enum OriginEvent {
    Headers { status: u16, headers: HeaderMap },
    Chunk(Bytes),
    Error(DocError),
    End,
}

pub type AbortFn = Box<dyn FnOnce() + Send>;

pub struct OriginConnection {
    pub events: mpsc::UnboundedReceiver<OriginEvent>,
    /// called at most once, when the reader is cancelled before the request ended
    pub abort: AbortFn,
}

impl Debug for OriginConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OriginConnection")
    }
}

/// A byte origin client supplied by the host application, e.g. wrapping the platform's fetch
///  primitive. It is used for both full and ranged requests.
#[cfg_attr(test, mockall::automock)]
pub trait ByteOriginClient: Send + Sync {
    fn open(&self, request: OriginRequest) -> OriginConnection;
}

/// Wraps a [ByteOriginClient] into the reader contract. The kind of origin is given explicitly,
///  it decides whether ranges are negotiated at all.
///
/// Every reader spawns a task forwarding its request's events, so readers must be requested
///  from inside a tokio runtime.
pub struct OriginByteSource {
    client: Arc<dyn ByteOriginClient>,
    url: String,
    origin: OriginKind,
    config: SourceConfig,
    headers: HeaderMap,
    readers: ReaderSet,
}

impl OriginByteSource {
    pub fn new(client: Arc<dyn ByteOriginClient>, url: &str, origin: OriginKind, config: SourceConfig) -> anyhow::Result<OriginByteSource> {
        config.validate()?;
        let headers = create_headers(origin, &config.http_headers);
        Ok(OriginByteSource {
            client,
            url: url.to_string(),
            origin,
            config,
            headers,
            readers: ReaderSet::default(),
        })
    }

    /// Opens the request and starts the task that turns its events into chunks
    fn open(&self, range: Option<(u64, u64)>, full: Option<SourceConfig>) -> Arc<OriginReaderShared> {
        let mut headers = self.headers.clone();
        if let Some((begin, end)) = range {
            if self.origin.is_http() {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes={}-{}", begin, end - 1)) {
                    headers.insert(RANGE, value);
                }
            }
        }

        let connection = self.client.open(OriginRequest {
            url: self.url.clone(),
            headers,
            range,
        });

        let shared = Arc::new(OriginReaderShared {
            url: self.url.clone(),
            origin: self.origin,
            queue: ChunkQueue::default(),
            meta: Latch::new(),
            cancelled: Latch::new(),
            abort: Mutex::new(Some(connection.abort)),
        });
        tokio::spawn(pump_events(shared.clone(), connection.events, full));
        shared
    }
}

impl ByteSource for OriginByteSource {
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>> {
        self.readers.claim_full_reader(|| Arc::new(OriginFullReader {
            shared: self.open(None, Some(self.config.clone())),
            config: self.config.clone(),
            loaded: self.readers.progressive_counter(),
            progress: ProgressSlot::default(),
        }))
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>> {
        if begin >= end || self.readers.is_already_delivered(end) {
            return None;
        }
        trace!(url = self.url, begin, end, "range reader");
        Some(self.readers.add_range_reader(Arc::new(OriginRangeReader {
            shared: self.open(Some((begin, end)), None),
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

#[derive(Clone, Debug, Default)]
struct ResponseMeta {
    content_length: Option<u64>,
    range_supported: bool,
    filename: Option<String>,
}

struct OriginReaderShared {
    url: String,
    origin: OriginKind,
    queue: ChunkQueue,
    meta: Latch<Result<ResponseMeta, DocError>>,
    cancelled: Latch<DocError>,
    abort: Mutex<Option<AbortFn>>,
}

impl OriginReaderShared {
    fn abort_request(&self) {
        let abort = self.abort.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(abort) = abort {
            abort();
        }
    }

    fn fail(&self, reason: DocError) {
        self.meta.set(Err(reason.clone()));
        self.queue.fail(reason);
        // the request is over, there is nothing left to abort
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn finish(&self) {
        self.meta.set(Ok(ResponseMeta::default()));
        self.queue.finish();
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn cancel(&self, reason: DocError) {
        if !self.cancelled.set(reason.clone()) {
            return;
        }
        self.meta.set(Err(reason));
        self.queue.cancel();
        self.abort_request();
    }

    fn on_headers(&self, status: u16, headers: &HeaderMap, full: Option<&SourceConfig>) -> Result<(), DocError> {
        if !validate_response_status(self.origin, status) {
            return Err(create_response_status_error(status, &self.url));
        }

        let Some(config) = full else {
            self.meta.set(Ok(ResponseMeta::default()));
            return Ok(());
        };

        let capabilities = validate_range_request_capabilities(self.origin, headers, config.range_chunk_size, config.disable_range)
            .map_err(|e| DocError::unknown("invalid source configuration", e.to_string()))?;
        let meta = ResponseMeta {
            content_length: capabilities.suggested_length.or(config.content_length),
            range_supported: capabilities.allow_range_requests,
            filename: extract_filename_from_header(headers),
        };
        debug!(url = self.url, status, ?meta, "response headers");
        self.meta.set(Ok(meta));

        if config.disable_stream && capabilities.allow_range_requests {
            debug!(url = self.url, "streaming is disabled - aborting the full request in favour of range requests");
            self.queue.cancel();
            self.abort_request();
        }
        Ok(())
    }
}

async fn pump_events(shared: Arc<OriginReaderShared>, mut events: mpsc::UnboundedReceiver<OriginEvent>, full: Option<SourceConfig>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shared.cancelled.wait() => return,
            event = events.recv() => event,
        };

        match event {
            Some(OriginEvent::Headers { status, headers }) => {
                if shared.meta.is_set() {
                    warn!(url = shared.url, "origin reported headers twice - ignoring");
                    continue;
                }
                if let Err(e) = shared.on_headers(status, &headers, full.as_ref()) {
                    shared.abort_request();
                    shared.fail(e);
                    return;
                }
            }
            Some(OriginEvent::Chunk(chunk)) => {
                if !shared.meta.is_set() {
                    // no headers - nothing to negotiate
                    shared.meta.set(Ok(ResponseMeta::default()));
                }
                shared.queue.push(chunk);
            }
            Some(OriginEvent::Error(e)) => {
                debug!(url = shared.url, error = %e, "origin reported an error");
                shared.fail(e);
                return;
            }
            Some(OriginEvent::End) => {
                shared.finish();
                return;
            }
            None => {
                shared.fail(DocError::unknown("byte origin closed the connection", shared.url.clone()));
                return;
            }
        }
    }
}

struct OriginFullReader {
    shared: Arc<OriginReaderShared>,
    config: SourceConfig,
    loaded: Arc<AtomicU64>,
    progress: ProgressSlot,
}

impl OriginFullReader {
    fn meta(&self) -> Option<ResponseMeta> {
        self.shared.meta.get().and_then(|r| r.ok())
    }
}

#[async_trait]
impl ByteReader for OriginFullReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.shared.queue.next().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, self.content_length());
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        debug!(url = self.shared.url, %reason, "cancelling full request");
        self.shared.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}

#[async_trait]
impl FullReader for OriginFullReader {
    async fn headers_ready(&self) -> Result<(), DocError> {
        self.shared.meta.wait().await.map(|_| ())
    }

    fn content_length(&self) -> Option<u64> {
        self.meta()
            .and_then(|m| m.content_length)
            .or(self.config.content_length)
    }

    fn is_range_supported(&self) -> bool {
        self.meta().map(|m| m.range_supported).unwrap_or(false)
    }

    fn is_streaming_supported(&self) -> bool {
        !self.config.disable_stream
    }

    fn filename(&self) -> Option<String> {
        self.meta().and_then(|m| m.filename)
    }
}

struct OriginRangeReader {
    shared: Arc<OriginReaderShared>,
    loaded: AtomicU64,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for OriginRangeReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.shared.queue.next().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, None);
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        self.shared.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}
