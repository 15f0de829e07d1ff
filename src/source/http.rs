use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, RANGE};
use hyper::{HeaderMap, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

use crate::config::SourceConfig;
use crate::error::DocError;
use crate::source::network_utils::{create_headers, create_response_status_error, extract_filename_from_header, validate_range_request_capabilities, validate_response_status, OriginKind};
use crate::source::{ByteReader, ByteSource, FullReader, ProgressCallback, ProgressSlot, ReaderSet};
use crate::util::latch::Latch;

pub type HttpClient = Client<HttpConnector, Empty<Bytes>>;

/// An http origin, fetched with hyper's client. Range requests use the `Range` header, and are
///  only made once the full response's headers showed they are worth it.
///
/// Only plain `http` URLs are supported: TLS needs a connector this crate does not ship.
pub struct HttpByteSource {
    url: Uri,
    config: SourceConfig,
    headers: HeaderMap,
    client: HttpClient,
    readers: ReaderSet,
}

impl HttpByteSource {
    pub fn new(url: &str, config: SourceConfig) -> anyhow::Result<HttpByteSource> {
        let client = Client::builder(TokioExecutor::new()).build_http();
        HttpByteSource::with_client(url, config, client)
    }

    pub fn with_client(url: &str, config: SourceConfig, client: HttpClient) -> anyhow::Result<HttpByteSource> {
        config.validate()?;
        let url: Uri = url.parse()?;
        if url.scheme_str() != Some("http") {
            bail!("unsupported URL {} - only http is supported", url);
        }

        let headers = create_headers(OriginKind::Http, &config.http_headers);
        Ok(HttpByteSource {
            url,
            config,
            headers,
            client,
            readers: ReaderSet::default(),
        })
    }

    fn request(&self, kind: RequestKind, headers: HeaderMap) -> HttpRequest {
        HttpRequest {
            url: self.url.clone(),
            client: self.client.clone(),
            headers,
            kind,
            response: OnceCell::new(),
            body: Mutex::new(None),
            cancelled: Latch::new(),
        }
    }
}

impl ByteSource for HttpByteSource {
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>> {
        self.readers.claim_full_reader(|| Arc::new(HttpFullReader {
            request: self.request(RequestKind::Full(self.config.clone()), self.headers.clone()),
            config: self.config.clone(),
            loaded: self.readers.progressive_counter(),
            progress: ProgressSlot::default(),
        }))
    }

    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>> {
        if begin >= end || self.readers.is_already_delivered(end) {
            return None;
        }

        let mut headers = self.headers.clone();
        let range = format!("bytes={}-{}", begin, end - 1);
        match HeaderValue::from_str(&range) {
            Ok(value) => {
                headers.insert(RANGE, value);
            }
            Err(_) => return None,
        }

        trace!(url = %self.url, begin, end, "range reader");
        Some(self.readers.add_range_reader(Arc::new(HttpRangeReader {
            request: self.request(RequestKind::Range, headers),
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

enum RequestKind {
    Full(SourceConfig),
    Range,
}

#[derive(Clone, Debug, Default)]
struct ResponseMeta {
    content_length: Option<u64>,
    range_supported: bool,
    filename: Option<String>,
}

/// One GET request, sent on first use. Its body is read frame by frame.
struct HttpRequest {
    url: Uri,
    client: HttpClient,
    headers: HeaderMap,
    kind: RequestKind,
    response: OnceCell<Result<ResponseMeta, DocError>>,
    body: Mutex<Option<Incoming>>,
    cancelled: Latch<DocError>,
}

impl HttpRequest {
    fn meta(&self) -> Option<ResponseMeta> {
        self.response.get()
            .and_then(|r| r.as_ref().ok())
            .cloned()
    }

    async fn start(&self) -> Result<ResponseMeta, DocError> {
        self.response.get_or_init(|| self.send()).await.clone()
    }

    async fn send(&self) -> Result<ResponseMeta, DocError> {
        tokio::select! {
            biased;
            reason = self.cancelled.wait() => Err(reason),
            result = self.fetch() => result,
        }
    }

    async fn fetch(&self) -> Result<ResponseMeta, DocError> {
        let url = self.url.to_string();

        let mut request = Request::get(self.url.clone())
            .body(Empty::new())
            .map_err(|e| DocError::unknown(format!("invalid request for {}", url), e.to_string()))?;
        *request.headers_mut() = self.headers.clone();

        let response = self.client.request(request).await
            .map_err(|e| {
                debug!(url, error = %e, "request failed");
                create_response_status_error(0, &url)
            })?;

        let status = response.status().as_u16();
        if !validate_response_status(OriginKind::Http, status) {
            return Err(create_response_status_error(status, &url));
        }

        let mut keep_body = true;
        let meta = match &self.kind {
            RequestKind::Range => ResponseMeta::default(),
            RequestKind::Full(config) => {
                let capabilities = validate_range_request_capabilities(OriginKind::Http, response.headers(), config.range_chunk_size, config.disable_range)
                    .map_err(|e| DocError::unknown("invalid source configuration", e.to_string()))?;
                if config.disable_stream && capabilities.allow_range_requests {
                    debug!(url, "streaming is disabled - dropping the full response in favour of range requests");
                    keep_body = false;
                }
                ResponseMeta {
                    content_length: capabilities.suggested_length.or(config.content_length),
                    range_supported: capabilities.allow_range_requests,
                    filename: extract_filename_from_header(response.headers()),
                }
            }
        };

        debug!(url, status, ?meta, "response headers");
        if keep_body {
            *self.body.lock().await = Some(response.into_body());
        }
        Ok(meta)
    }

    async fn next_chunk(&self) -> Result<Option<Bytes>, DocError> {
        if let Err(e) = self.start().await {
            if self.cancelled.is_set() {
                return Ok(None);
            }
            return Err(e);
        }

        let mut body = self.body.lock().await;
        loop {
            if self.cancelled.is_set() {
                *body = None;
                return Ok(None);
            }
            let Some(incoming) = body.as_mut() else {
                return Ok(None);
            };

            let frame = tokio::select! {
                biased;
                _ = self.cancelled.wait() => None,
                frame = incoming.frame() => Some(frame),
            };

            match frame {
                None | Some(None) => {
                    *body = None;
                    return Ok(None);
                }
                Some(Some(Err(e))) => {
                    *body = None;
                    debug!(url = %self.url, error = %e, "error reading response body");
                    return Err(create_response_status_error(0, &self.url.to_string()));
                }
                Some(Some(Ok(frame))) => {
                    // trailers and empty data frames carry nothing for us
                    if let Ok(data) = frame.into_data() {
                        if !data.is_empty() {
                            return Ok(Some(data));
                        }
                    }
                }
            }
        }
    }

    fn cancel(&self, reason: DocError) {
        if self.cancelled.set(reason) {
            if let Ok(mut body) = self.body.try_lock() {
                *body = None;
            }
        }
    }
}

struct HttpFullReader {
    request: HttpRequest,
    config: SourceConfig,
    loaded: Arc<AtomicU64>,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for HttpFullReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.request.next_chunk().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, self.content_length());
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        debug!(url = %self.request.url, %reason, "cancelling full request");
        self.request.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}

#[async_trait]
impl FullReader for HttpFullReader {
    async fn headers_ready(&self) -> Result<(), DocError> {
        self.request.start().await.map(|_| ())
    }

    fn content_length(&self) -> Option<u64> {
        self.request.meta()
            .and_then(|m| m.content_length)
            .or(self.config.content_length)
    }

    fn is_range_supported(&self) -> bool {
        self.request.meta()
            .map(|m| m.range_supported)
            .unwrap_or(false)
    }

    fn is_streaming_supported(&self) -> bool {
        !self.config.disable_stream
    }

    fn filename(&self) -> Option<String> {
        self.request.meta().and_then(|m| m.filename)
    }
}

struct HttpRangeReader {
    request: HttpRequest,
    loaded: AtomicU64,
    progress: ProgressSlot,
}

#[async_trait]
impl ByteReader for HttpRangeReader {
    async fn read(&self) -> Result<Option<Bytes>, DocError> {
        let chunk = self.request.next_chunk().await?;
        if let Some(chunk) = &chunk {
            let loaded = self.loaded.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
            self.progress.report(loaded, None);
        }
        Ok(chunk)
    }

    fn cancel(&self, reason: DocError) {
        self.request.cancel(reason);
    }

    fn set_on_progress(&self, callback: ProgressCallback) {
        self.progress.set(callback);
    }
}
