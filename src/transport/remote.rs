use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DocError, PasswordCode};
use crate::rpc::endpoint::RpcEndpoint;
use crate::rpc::message::Payload;
use crate::rpc::sink::StreamSink;
use crate::source::ByteSource;
use crate::transport::operator_list::{OperatorListChunk, RenderIntent};
use crate::transport::remote_stream::RemoteByteSource;
use crate::transport::{ACTION_GET_OPERATOR_LIST, ACTION_GET_PAGE, ACTION_OPEN_DOCUMENT, ACTION_PASSWORD_REQUEST, ACTION_TERMINATE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub num_pages: u32,
    pub fingerprint: String,
    /// the number of bytes the parser loaded
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page_index: u32,
    pub rotate: i32,
    /// `[x0, y0, x1, y1]` in page units
    pub view: [f64; 4],
}

/// `OpenDocument` parameters. The document's bytes travel in the payload's binary part, unless
///  `has_stream` is set - then the remote side reads them through `GetReader` / `GetRangeReader`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentParams {
    pub has_stream: bool,
    pub length: Option<u64>,
    pub range_chunk_size: u64,
    pub disable_auto_fetch: bool,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPageParams {
    pub page_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorListParams {
    pub page_index: u32,
    pub intent: RenderIntent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordRequest {
    pub code: PasswordCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordResponse {
    pub password: String,
}

/// Where the parser gets the document's bytes
#[derive(Clone)]
pub enum DocumentBytes {
    Data(Bytes),
    Stream(Arc<dyn ByteSource>),
}

impl Debug for DocumentBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentBytes::Data(data) => write!(f, "Data({} bytes)", data.len()),
            DocumentBytes::Stream(_) => write!(f, "Stream"),
        }
    }
}

/// The producer side of a page's operator list stream
pub struct OperatorListSink {
    sink: StreamSink,
}

impl OperatorListSink {
    pub fn new(sink: StreamSink) -> OperatorListSink {
        OperatorListSink { sink }
    }

    /// Waits for the consumer to want more, then sends `chunk`. Fails with the consumer's
    ///  reason once the stream was cancelled.
    pub async fn send(&self, chunk: OperatorListChunk) -> Result<(), DocError> {
        self.sink.ready().await?;
        let size = chunk.len().max(1) as i64;
        let payload = Payload::from_serde(&chunk)?;
        self.sink.enqueue(payload, size)
            .map_err(|e| DocError::unknown("operator list stream is closed", e.to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.sink.is_cancelled()
    }
}

/// The document parser on the remote side, outside of this crate
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// A [DocError::Password] makes the remote side ask the main side for a password and call
    ///  this again with it.
    async fn open(&self, bytes: DocumentBytes, password: Option<String>) -> Result<DocumentInfo, DocError>;

    async fn get_page(&self, page_index: u32) -> Result<PageInfo, DocError>;

    /// Sends the page's operator list, the last chunk flagged as such.
    async fn operator_list(&self, page_index: u32, intent: RenderIntent, sink: OperatorListSink) -> Result<(), DocError>;

    async fn terminate(&self);
}

struct HostShared {
    endpoint: RpcEndpoint,
    parser: Arc<dyn DocumentParser>,
    source: Mutex<Option<Arc<RemoteByteSource>>>,
    terminated: AtomicBool,
}

impl HostShared {
    fn ensure_not_terminated(&self) -> Result<(), DocError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(DocError::abort("the remote side was terminated"));
        }
        Ok(())
    }

    async fn open_document(&self, data: Payload) -> Result<Payload, DocError> {
        self.ensure_not_terminated()?;
        let params: OpenDocumentParams = data.decode()?;

        let bytes = if params.has_stream {
            let source = Arc::new(RemoteByteSource::new(self.endpoint.clone()));
            *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(source.clone());
            DocumentBytes::Stream(source)
        }
        else {
            DocumentBytes::Data(data.binary.unwrap_or_default())
        };

        let mut password = params.password;
        loop {
            match self.parser.open(bytes.clone(), password.take()).await {
                Ok(info) => {
                    info!(num_pages = info.num_pages, length = info.length, "document opened");
                    return Payload::from_serde(&info);
                }
                Err(DocError::Password { code, .. }) => {
                    debug!(?code, "asking for a password");
                    let answer = self.endpoint.call(ACTION_PASSWORD_REQUEST, Payload::from_serde(&PasswordRequest { code })?).await?;
                    password = Some(answer.decode::<PasswordResponse>()?.password);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_page(&self, data: Payload) -> Result<Payload, DocError> {
        self.ensure_not_terminated()?;
        let params: GetPageParams = data.decode()?;
        Payload::from_serde(&self.parser.get_page(params.page_index).await?)
    }

    fn operator_list(&self, data: Payload, sink: StreamSink) -> Result<(), DocError> {
        self.ensure_not_terminated()?;
        let OperatorListParams { page_index, intent } = data.decode()?;

        let parser = self.parser.clone();
        let producer = sink.clone();
        let task = tokio::spawn(async move {
            match parser.operator_list(page_index, intent, OperatorListSink::new(producer.clone())).await {
                Ok(()) => producer.close(),
                Err(e) => producer.error(e),
            }
        });

        let abort = task.abort_handle();
        sink.set_on_cancel(move |reason| async move {
            debug!(page_index, %intent, %reason, "operator list cancelled");
            abort.abort();
            Ok(())
        });
        Ok(())
    }

    async fn terminate(&self) -> Result<Payload, DocError> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(Payload::empty());
        }
        info!("terminating");
        let source = self.source.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(source) = source {
            source.cancel_all_requests(DocError::abort("the remote side was terminated"));
        }
        self.parser.terminate().await;
        Ok(Payload::empty())
    }
}

/// The remote side of the document protocol: serves the main side's requests from a
///  [DocumentParser], and gives the parser access to the main side's bytes.
#[derive(Clone)]
pub struct RemoteHost {
    shared: Arc<HostShared>,
}

impl RemoteHost {
    pub fn new(endpoint: RpcEndpoint, parser: Arc<dyn DocumentParser>) -> anyhow::Result<RemoteHost> {
        let shared = Arc::new(HostShared {
            endpoint: endpoint.clone(),
            parser,
            source: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });

        let s = shared.clone();
        endpoint.on(ACTION_OPEN_DOCUMENT, move |data| {
            let s = s.clone();
            async move { s.open_document(data).await }
        })?;

        let s = shared.clone();
        endpoint.on(ACTION_GET_PAGE, move |data| {
            let s = s.clone();
            async move { s.get_page(data).await }
        })?;

        let s = shared.clone();
        endpoint.on_stream(ACTION_GET_OPERATOR_LIST, move |data, sink| {
            let result = s.operator_list(data, sink);
            async move { result }
        })?;

        let s = shared.clone();
        endpoint.on(ACTION_TERMINATE, move |_| {
            let s = s.clone();
            async move { s.terminate().await }
        })?;

        Ok(RemoteHost { shared })
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}
