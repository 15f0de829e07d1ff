use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::select;
use tracing::{debug, trace, warn};

use crate::error::DocError;
use crate::rpc::endpoint::RpcEndpoint;
use crate::rpc::message::Payload;
use crate::rpc::stream::StreamHandle;
use crate::source::{ByteReader, ByteSource, FullReader, ProgressCallback, ProgressSlot, ReaderSet};
use crate::transport::{ACTION_GET_RANGE_READER, ACTION_GET_READER, ACTION_READER_HEADERS_READY};
use crate::util::latch::Latch;

/// The full reader's metadata as the main side reports it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderHeaders {
    pub is_streaming_supported: bool,
    pub is_range_supported: bool,
    pub content_length: Option<u64>,
    pub filename: Option<String>,
}

/// The remote side's view of the main side's byte source: every reader is an RPC stream served
///  by the main side's [crate::transport::document::DocumentTransport].
pub struct RemoteByteSource {
    endpoint: RpcEndpoint,
    readers: ReaderSet,
}

impl RemoteByteSource {
    pub fn new(endpoint: RpcEndpoint) -> RemoteByteSource {
        RemoteByteSource {
            endpoint,
            readers: ReaderSet::default(),
        }
    }
}

impl ByteSource for RemoteByteSource {
    /// Must be called from inside a tokio runtime: the headers are requested by a spawned task.
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>> {
        self.readers.claim_full_reader(|| {
            let stream = Arc::new(self.endpoint.open_stream(ACTION_GET_READER, Payload::empty(), None));

            let headers = Arc::new(Latch::new());
            let endpoint = self.endpoint.clone();
            let headers2 = headers.clone();
            tokio::spawn(async move {
                let result = endpoint.call(ACTION_READER_HEADERS_READY, Payload::empty()).await
                    .and_then(|payload| payload.decode::<ReaderHeaders>());
                if let Err(e) = &result {
                    debug!(error = %e, "reader headers failed");
                }
                headers2.set(result);
            });

            Arc::new(RemoteFullReader {
                reader: StreamReader::new(stream),
                headers,
                loaded: self.readers.progressive_counter(),
                progress: ProgressSlot::default(),
            })
        })
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>> {
        if begin >= end || self.readers.is_already_delivered(end) {
            return None;
        }
        trace!(begin, end, "requesting range from main side");
        let stream = self.endpoint.open_stream(ACTION_GET_RANGE_READER, Payload::value(json!({"begin": begin, "end": end})), None);
        Some(self.readers.add_range_reader(Arc::new(RemoteRangeReader {
            reader: StreamReader::new(Arc::new(stream)),
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

/// A byte stream coming in over RPC, with chunks in the payloads' binary part
struct StreamReader {
    stream: Arc<StreamHandle>,
    cancelled: Latch<()>,
}

impl StreamReader {
    fn new(stream: Arc<StreamHandle>) -> StreamReader {
        StreamReader { stream, cancelled: Latch::new() }
    }

    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        select! {
            biased;
            _ = self.cancelled.wait() => Ok(None),
            chunk = self.stream.read() => match chunk? {
                None => Ok(None),
                Some(payload) => match payload.binary {
                    Some(chunk) => Ok(Some(chunk)),
                    None => Err(DocError::unknown("unexpected byte stream chunk", format!("{:?}", payload.value))),
                },
            },
        }
    }

    /// The cancel exchange is asynchronous, reads end right away regardless.
    fn cancel(&self, reason: DocError) {
        if !self.cancelled.set(()) {
            return;
        }
        let stream = self.stream.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.cancel(reason).await {
                warn!(stream_id = stream.stream_id(), error = %e, "cancelling byte stream failed");
            }
        });
    }
}

struct RemoteFullReader {
    reader: StreamReader,
    headers: Arc<Latch<Result<ReaderHeaders, DocError>>>,
    loaded: Arc<AtomicU64>,
    progress: ProgressSlot,
}

impl RemoteFullReader {
    fn headers(&self) -> Option<ReaderHeaders> {
        self.headers.get().and_then(|h| h.ok())
    }
}

#[async_trait]
impl ByteReader for RemoteFullReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.reader.read().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, self.content_length());
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        self.reader.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}

#[async_trait]
impl FullReader for RemoteFullReader {
    async fn headers_ready(&self) -> Result<(), DocError> {
        self.headers.wait().await.map(|_| ())
    }

    fn content_length(&self) -> Option<u64> {
        self.headers().and_then(|h| h.content_length)
    }

    fn is_range_supported(&self) -> bool {
        self.headers().map(|h| h.is_range_supported).unwrap_or(false)
    }

    fn is_streaming_supported(&self) -> bool {
        self.headers().map(|h| h.is_streaming_supported).unwrap_or(false)
    }

    fn filename(&self) -> Option<String> {
        self.headers().and_then(|h| h.filename)
    }
}

struct RemoteRangeReader {
    reader: StreamReader,
    loaded: AtomicU64,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for RemoteRangeReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.reader.read().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, None);
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        self.reader.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}
