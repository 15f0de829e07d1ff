use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::select;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{DocError, PasswordCode};
use crate::rpc::endpoint::RpcEndpoint;
use crate::rpc::message::Payload;
use crate::rpc::sink::StreamSink;
use crate::source::{ByteReader, ByteSource, FullReader, ProgressCallback};
use crate::transport::page::PageProxy;
use crate::transport::remote::{DocumentInfo, GetPageParams, OpenDocumentParams, PageInfo, PasswordRequest, PasswordResponse};
use crate::transport::remote_stream::ReaderHeaders;
use crate::transport::{ACTION_GET_PAGE, ACTION_GET_RANGE_READER, ACTION_GET_READER, ACTION_OPEN_DOCUMENT, ACTION_PASSWORD_REQUEST, ACTION_READER_HEADERS_READY, ACTION_TERMINATE};
use crate::util::latch::Latch;

/// Asks the application for a password. `None` means the user gave up.
pub type PasswordCallback = Arc<dyn Fn(PasswordCode) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Where the main side gets the document's bytes
#[derive(Clone)]
pub enum DocumentSource {
    /// the complete document, sent along with `OpenDocument`
    Data(Bytes),
    /// read by the remote side through `GetReader` / `GetRangeReader`
    Stream(Arc<dyn ByteSource>),
}

impl Debug for DocumentSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentSource::Data(data) => write!(f, "Data({} bytes)", data.len()),
            DocumentSource::Stream(_) => write!(f, "Stream"),
        }
    }
}

pub struct OpenParams {
    pub source: DocumentSource,
    pub password: Option<String>,
    pub on_password: Option<PasswordCallback>,
    /// progress of the full reader
    pub on_progress: Option<ProgressCallback>,
    pub config: TransportConfig,
}

impl OpenParams {
    pub fn new(source: DocumentSource) -> OpenParams {
        OpenParams {
            source,
            password: None,
            on_password: None,
            on_progress: None,
            config: TransportConfig::default(),
        }
    }

    pub fn with_password(mut self, password: &str) -> OpenParams {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_password_callback(mut self, on_password: PasswordCallback) -> OpenParams {
        self.on_password = Some(on_password);
        self
    }

    pub fn with_progress(mut self, on_progress: ProgressCallback) -> OpenParams {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn with_config(mut self, config: TransportConfig) -> OpenParams {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportPhase {
    Opening,
    Ready,
    Destroying,
    Destroyed,
}

type PageFuture = Shared<BoxFuture<'static, Result<Arc<PageProxy>, DocError>>>;

struct TransportState {
    phase: TransportPhase,
    info: Option<DocumentInfo>,
    pages: FxHashMap<u32, PageFuture>,
}

struct TransportShared {
    endpoint: RpcEndpoint,
    config: TransportConfig,
    source: DocumentSource,
    password: Option<String>,
    on_password: Option<PasswordCallback>,
    on_progress: Option<ProgressCallback>,
    full_reader: Latch<Arc<dyn FullReader>>,
    /// set when destroying starts, rejects pending password prompts
    destroying: Latch<DocError>,
    state: Mutex<TransportState>,
    destroy_outcome: OnceCell<Result<(), DocError>>,
}

/// The main side of a document: opens it on the remote side, hands out pages, and serves the
///  remote side's byte requests from the [ByteSource]. Cloning gives another handle to the same
///  document.
#[derive(Clone)]
pub struct DocumentTransport {
    shared: Arc<TransportShared>,
}

impl Debug for DocumentTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentTransport{{{:?}, {:?}}}", self.shared.source, self.phase())
    }
}

impl DocumentTransport {
    /// Registers the main side handlers on `endpoint`. The document is opened by
    ///  [DocumentTransport::open].
    pub fn new(endpoint: RpcEndpoint, params: OpenParams) -> anyhow::Result<DocumentTransport> {
        params.config.validate()?;

        let shared = Arc::new(TransportShared {
            endpoint: endpoint.clone(),
            config: params.config,
            source: params.source,
            password: params.password,
            on_password: params.on_password,
            on_progress: params.on_progress,
            full_reader: Latch::new(),
            destroying: Latch::new(),
            state: Mutex::new(TransportState {
                phase: TransportPhase::Opening,
                info: None,
                pages: Default::default(),
            }),
            destroy_outcome: OnceCell::new(),
        });

        if let DocumentSource::Stream(source) = &shared.source {
            let s = shared.clone();
            let source2 = source.clone();
            endpoint.on_stream(ACTION_GET_READER, move |_, sink| {
                let result = s.serve_full_reader(source2.as_ref(), sink);
                async move { result }
            })?;

            let source2 = source.clone();
            endpoint.on_stream(ACTION_GET_RANGE_READER, move |data, sink| {
                let result = serve_range_reader(source2.as_ref(), data, sink);
                async move { result }
            })?;

            let s = shared.clone();
            endpoint.on(ACTION_READER_HEADERS_READY, move |_| {
                let s = s.clone();
                async move { s.reader_headers().await }
            })?;
        }

        let s = shared.clone();
        endpoint.on(ACTION_PASSWORD_REQUEST, move |data| {
            let s = s.clone();
            async move { s.request_password(data).await }
        })?;

        Ok(DocumentTransport { shared })
    }

    pub fn phase(&self) -> TransportPhase {
        self.shared.state().phase
    }

    pub fn info(&self) -> Option<DocumentInfo> {
        self.shared.state().info.clone()
    }

    pub fn num_pages(&self) -> Option<u32> {
        self.info().map(|i| i.num_pages)
    }

    /// The full reader's metadata, once the remote side asked for it
    pub fn source_headers(&self) -> Option<ReaderHeaders> {
        self.shared.full_reader.get().map(|r| headers_of(r.as_ref()))
    }

    /// Opens the document on the remote side. A failure leaves the transport in the opening
    ///  phase, the caller is expected to destroy it.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self) -> Result<DocumentInfo, DocError> {
        self.shared.ensure_phase(TransportPhase::Opening)?;

        let source_config = &self.shared.config.source;
        let mut params = OpenDocumentParams {
            has_stream: false,
            length: source_config.content_length,
            range_chunk_size: source_config.range_chunk_size,
            disable_auto_fetch: source_config.disable_auto_fetch,
            password: self.shared.password.clone(),
        };
        let payload = match &self.shared.source {
            DocumentSource::Data(data) => {
                params.length = Some(data.len() as u64);
                Payload::from_serde(&params)?.with_binary(data.clone())
            }
            DocumentSource::Stream(_) => {
                params.has_stream = true;
                Payload::from_serde(&params)?
            }
        };

        let info: DocumentInfo = self.shared.endpoint.call(ACTION_OPEN_DOCUMENT, payload).await?.decode()?;

        let mut state = self.shared.state();
        if state.phase != TransportPhase::Opening {
            return Err(DocError::abort("the document was destroyed while it was opened"));
        }
        info!(num_pages = info.num_pages, fingerprint = %info.fingerprint, "document is ready");
        state.phase = TransportPhase::Ready;
        state.info = Some(info.clone());
        Ok(info)
    }

    /// The page at `page_index`. Concurrent and repeated requests for the same page share the
    ///  same [PageProxy]; a failed request is not cached.
    pub async fn get_page(&self, page_index: u32) -> Result<Arc<PageProxy>, DocError> {
        let future = {
            let mut state = self.shared.state();
            match state.phase {
                TransportPhase::Ready => {}
                TransportPhase::Opening => return Err(DocError::unknown("invalid page request", "the document is not open yet")),
                TransportPhase::Destroying | TransportPhase::Destroyed => return Err(DocError::abort("the document was destroyed")),
            }
            let num_pages = state.info.as_ref().map(|i| i.num_pages).unwrap_or(0);
            if page_index >= num_pages {
                return Err(DocError::unknown("invalid page request", format!("page index {} of {} pages", page_index, num_pages)));
            }

            state.pages.entry(page_index)
                .or_insert_with(|| self.shared.clone().fetch_page(page_index).boxed().shared())
                .clone()
        };

        let result = future.await;
        if let Err(e) = &result {
            debug!(page_index, error = %e, "page request failed");
            let mut state = self.shared.state();
            if let Some(f) = state.pages.get(&page_index) {
                if f.peek().map(|r| r.is_err()).unwrap_or(false) {
                    state.pages.remove(&page_index);
                }
            }
        }
        result
    }

    /// Tears the document down, in this order: pending password prompts are rejected, open
    ///  pages are destroyed, the remote side is terminated, byte requests are cancelled, and the
    ///  endpoint is destroyed. Calling this more than once returns the first call's outcome.
    pub async fn destroy(&self) -> Result<(), DocError> {
        let shared = self.shared.clone();
        self.shared.destroy_outcome
            .get_or_init(|| shared.destroy())
            .await
            .clone()
    }
}

impl TransportShared {
    fn state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_phase(&self, expected: TransportPhase) -> Result<(), DocError> {
        let phase = self.state().phase;
        match phase {
            p if p == expected => Ok(()),
            TransportPhase::Destroying | TransportPhase::Destroyed => Err(DocError::abort("the document was destroyed")),
            p => Err(DocError::unknown("unexpected document state", format!("{:?}", p))),
        }
    }

    async fn fetch_page(self: Arc<Self>, page_index: u32) -> Result<Arc<PageProxy>, DocError> {
        trace!(page_index, "fetching page");
        let info: PageInfo = self.endpoint.call(ACTION_GET_PAGE, Payload::from_serde(&GetPageParams { page_index })?).await?.decode()?;
        let page = Arc::new(PageProxy::new(info, self.endpoint.clone(), self.config.render.clone()));

        // NB: destroy only reaches pages that were resolved when it started
        if let Err(e) = self.ensure_phase(TransportPhase::Ready) {
            debug!(page_index, "page arrived after the document started to be destroyed");
            page.destroy().await;
            return Err(e);
        }
        Ok(page)
    }

    /// Bridges the full reader to the `GetReader` stream: each pull reads one chunk and
    ///  enqueues it.
    fn serve_full_reader(&self, source: &dyn ByteSource, sink: StreamSink) -> Result<(), DocError> {
        let reader = source.get_full_reader()
            .map_err(|e| DocError::unknown("full reader is not available", e.to_string()))?;
        if let Some(on_progress) = &self.on_progress {
            reader.set_on_progress(on_progress.clone());
        }
        self.full_reader.set(reader.clone());

        let full: Arc<dyn FullReader> = reader.clone();
        bridge_reader(&sink, move || {
            let reader = full.clone();
            async move { reader.read().await }
        }, move |reason| reader.cancel(reason));
        Ok(())
    }

    async fn reader_headers(&self) -> Result<Payload, DocError> {
        let reader = self.full_reader.wait().await;
        reader.headers_ready().await?;
        let headers = headers_of(reader.as_ref());
        debug!(?headers, "reader headers are ready");
        Payload::from_serde(&headers)
    }

    async fn request_password(&self, data: Payload) -> Result<Payload, DocError> {
        let request: PasswordRequest = data.decode()?;
        let Some(on_password) = self.on_password.clone() else {
            return Err(DocError::Password { message: "no password callback".to_string(), code: request.code });
        };

        select! {
            reason = self.destroying.wait() => Err(reason),
            password = on_password(request.code) => match password {
                Some(password) => Payload::from_serde(&PasswordResponse { password }),
                None => Err(DocError::Password { message: "no password given".to_string(), code: request.code }),
            },
        }
    }

    #[tracing::instrument(skip(self))]
    async fn destroy(self: Arc<Self>) -> Result<(), DocError> {
        let pages = {
            let mut state = self.state();
            state.phase = TransportPhase::Destroying;
            std::mem::take(&mut state.pages)
        };
        info!("destroying document");

        let reason = DocError::abort("the document was destroyed");
        self.destroying.set(reason.clone());

        for (page_index, page) in pages {
            if let Some(Ok(page)) = page.peek() {
                trace!(page_index, "destroying page");
                page.destroy().await;
            }
        }

        let terminated = self.endpoint.call(ACTION_TERMINATE, Payload::empty()).await.map(|_| ());
        if let Err(e) = &terminated {
            warn!(error = %e, "terminating the remote side failed");
        }

        if let DocumentSource::Stream(source) = &self.source {
            source.cancel_all_requests(reason);
        }
        self.endpoint.destroy();

        self.state().phase = TransportPhase::Destroyed;
        info!("document destroyed");
        terminated
    }
}

fn headers_of(reader: &dyn FullReader) -> ReaderHeaders {
    ReaderHeaders {
        is_streaming_supported: reader.is_streaming_supported(),
        is_range_supported: reader.is_range_supported(),
        content_length: reader.content_length(),
        filename: reader.filename(),
    }
}

#[derive(Deserialize)]
struct RangeParams {
    begin: u64,
    end: u64,
}

/// Bridges a range reader to a `GetRangeReader` stream. A range the full reader already
///  delivered closes the stream right away.
fn serve_range_reader(source: &dyn ByteSource, data: Payload, sink: StreamSink) -> Result<(), DocError> {
    let RangeParams { begin, end } = data.decode()?;
    let Some(reader) = source.get_range_reader(begin, end) else {
        trace!(begin, end, "range was already delivered");
        sink.close();
        return Ok(());
    };

    let range = reader.clone();
    bridge_reader(&sink, move || {
        let reader = range.clone();
        async move { reader.read().await }
    }, move |reason| reader.cancel(reason));
    Ok(())
}

/// pull -> one read -> one enqueue, in lockstep
fn bridge_reader<R, Fut, C>(sink: &StreamSink, read: R, cancel: C)
where
    R: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Bytes>, DocError>> + Send + 'static,
    C: FnOnce(DocError) + Send + 'static,
{
    let producer = sink.clone();
    sink.set_on_pull(move || {
        let producer = producer.clone();
        let chunk = read();
        async move {
            match chunk.await {
                Ok(Some(chunk)) => {
                    if let Err(e) = producer.enqueue(Payload::binary(chunk), 1) {
                        debug!(stream_id = producer.stream_id(), error = %e, "dropping chunk");
                    }
                }
                Ok(None) => producer.close(),
                Err(e) => producer.error(e),
            }
            Ok(())
        }
    });
    sink.set_on_cancel(move |reason| async move {
        cancel(reason);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use async_trait::async_trait;
    use mockall::Sequence;
    use crate::config::SourceConfig;
    use crate::source::range_transport::{MockRangeTransportHost, RangeTransportInit, RangeTransportSource};
    use crate::test_util::{eventually, loopback_endpoints, StaticParser};
    use crate::transport::operator_list::RenderIntent;
    use crate::transport::remote::{DocumentBytes, DocumentParser, OperatorListSink, RemoteHost};
    use super::*;

    /// Notes the order of teardown steps as the remote side sees them
    struct TeardownParser {
        inner: StaticParser,
        page: Latch<Arc<PageProxy>>,
        events: Arc<StdMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl DocumentParser for TeardownParser {
        async fn open(&self, bytes: DocumentBytes, password: Option<String>) -> Result<DocumentInfo, DocError> {
            self.inner.open(bytes, password).await
        }

        async fn get_page(&self, page_index: u32) -> Result<PageInfo, DocError> {
            self.inner.get_page(page_index).await
        }

        async fn operator_list(&self, page_index: u32, intent: RenderIntent, sink: OperatorListSink) -> Result<(), DocError> {
            self.inner.operator_list(page_index, intent, sink).await
        }

        async fn terminate(&self) {
            if self.page.get().is_some_and(|page| page.is_destroyed()) {
                self.events.lock().unwrap().push("page destroyed");
            }
            self.events.lock().unwrap().push("terminated");
            self.inner.terminate().await;
        }
    }

    fn setup(parser: StaticParser, params: OpenParams) -> (DocumentTransport, Arc<StaticParser>, RemoteHost) {
        let (main, worker) = loopback_endpoints();
        let parser = Arc::new(parser);
        let host = RemoteHost::new(worker, parser.clone()).unwrap();
        (DocumentTransport::new(main, params).unwrap(), parser, host)
    }

    fn pushed_source(data: &'static [u8]) -> Arc<RangeTransportSource> {
        let mut host = MockRangeTransportHost::new();
        host.expect_transport_ready().return_const(());
        host.expect_request_data_range().return_const(());
        host.expect_abort().return_const(());
        let init = RangeTransportInit {
            length: Some(data.len() as u64),
            initial_data: Some(Bytes::from_static(data)),
            progressive_done: true,
            content_disposition_filename: Some("pushed.pdf".to_string()),
        };
        Arc::new(RangeTransportSource::new(init, Arc::new(host), SourceConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_open_with_data() {
        let (transport, parser, _host) = setup(StaticParser::new(3), OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-1.7"))));
        assert_eq!(transport.phase(), TransportPhase::Opening);

        let info = transport.open().await.unwrap();
        assert_eq!(info.num_pages, 3);
        assert_eq!(info.length, 8);
        assert_eq!(transport.phase(), TransportPhase::Ready);
        assert_eq!(parser.loaded_length(), Some(8));
        assert!(transport.open().await.is_err());
    }

    #[tokio::test]
    async fn test_open_with_stream() {
        let source = pushed_source(b"%PDF-1.7 streamed");
        let (transport, parser, _host) = setup(StaticParser::new(1), OpenParams::new(DocumentSource::Stream(source.clone())));

        let info = transport.open().await.unwrap();
        assert_eq!(info.length, 17);
        assert_eq!(parser.loaded_length(), Some(17));
        assert_eq!(source.progressive_data_length(), 17);

        let headers = transport.source_headers().unwrap();
        assert_eq!(headers.content_length, Some(17));
        assert_eq!(headers.filename, Some("pushed.pdf".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_document() {
        let (transport, _parser, _host) = setup(StaticParser::new(1), OpenParams::new(DocumentSource::Data(Bytes::new())));
        assert!(matches!(transport.open().await, Err(DocError::InvalidDocument { .. })));
        assert_eq!(transport.destroy().await, Ok(()));
    }

    #[tokio::test]
    async fn test_password_callback() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let prompts2 = prompts.clone();
        let on_password: PasswordCallback = Arc::new(move |code: PasswordCode| {
            let attempt = prompts2.fetch_add(1, Ordering::SeqCst);
            async move {
                match (attempt, code) {
                    (0, PasswordCode::IncorrectPassword) => Some("secret".to_string()),
                    _ => None,
                }
            }.boxed()
        });

        let params = OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-")))
            .with_password("wrong")
            .with_password_callback(on_password);
        let (transport, _parser, _host) = setup(StaticParser::new(1).with_password("secret"), params);

        assert!(transport.open().await.is_ok());
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_password_callback() {
        let params = OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-")));
        let (transport, _parser, _host) = setup(StaticParser::new(1).with_password("secret"), params);

        assert!(matches!(transport.open().await, Err(DocError::Password { code: PasswordCode::NeedPassword, .. })));
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_password_prompt() {
        let on_password: PasswordCallback = Arc::new(|_: PasswordCode| futures::future::pending::<Option<String>>().boxed());
        let params = OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-")))
            .with_password_callback(on_password);
        let (transport, _parser, _host) = setup(StaticParser::new(1).with_password("secret"), params);

        let transport2 = transport.clone();
        let opening = tokio::spawn(async move { transport2.open().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.destroy().await, Ok(()));
        let result = tokio::time::timeout(Duration::from_secs(1), opening).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_abort());
        assert_eq!(transport.phase(), TransportPhase::Destroyed);
    }

    #[tokio::test]
    async fn test_pages_are_cached() {
        let (transport, parser, _host) = setup(StaticParser::new(2), OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-"))));
        transport.open().await.unwrap();

        let (a, b) = tokio::join!(transport.get_page(1), transport.get_page(1));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(parser.page_requests(), 1);

        assert_eq!(transport.get_page(1).await.unwrap().page_index(), 1);
        assert!(transport.get_page(2).await.is_err());
        assert_eq!(parser.page_requests(), 1);
    }

    #[tokio::test]
    async fn test_get_page_in_flight_during_destroy() {
        let (transport, parser, host) = setup(StaticParser::new(2).with_stalled_pages(), OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-"))));
        transport.open().await.unwrap();

        let transport2 = transport.clone();
        let page = tokio::spawn(async move { transport2.get_page(0).await });
        eventually(|| parser.page_requests() == 1).await;

        assert_eq!(transport.destroy().await, Ok(()));
        let result = tokio::time::timeout(Duration::from_secs(1), page).await.unwrap().unwrap();
        assert!(matches!(result, Err(DocError::Abort { .. })));
        assert!(host.is_terminated());
        assert!(parser.is_terminated());
    }

    #[tokio::test]
    async fn test_page_answered_during_destroy_is_rejected() {
        let (transport, parser, _host) = setup(StaticParser::new(2).with_pages_held_until_terminate(), OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-"))));
        transport.open().await.unwrap();

        let transport2 = transport.clone();
        let page = tokio::spawn(async move { transport2.get_page(0).await });
        eventually(|| parser.page_requests() == 1).await;

        assert_eq!(transport.destroy().await, Ok(()));
        let result = tokio::time::timeout(Duration::from_secs(1), page).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_abort());
        assert!(parser.is_terminated());
    }

    #[tokio::test]
    async fn test_destroy_order() {
        let data: &'static [u8] = b"%PDF-1.7 pushed";
        let events = Arc::new(StdMutex::new(Vec::new()));
        let (main, worker) = loopback_endpoints();

        let mut seq = Sequence::new();
        let mut source_host = MockRangeTransportHost::new();
        source_host.expect_transport_ready().times(1).in_sequence(&mut seq).return_const(());
        source_host.expect_request_data_range().return_const(());
        let events2 = events.clone();
        let main2 = main.clone();
        source_host.expect_abort().times(1).in_sequence(&mut seq).returning(move || {
            assert!(!main2.is_destroyed());
            events2.lock().unwrap().push("source cancelled");
        });
        let init = RangeTransportInit {
            length: Some(data.len() as u64),
            initial_data: Some(Bytes::from_static(data)),
            progressive_done: true,
            content_disposition_filename: None,
        };
        let source = Arc::new(RangeTransportSource::new(init, Arc::new(source_host), SourceConfig::default()).unwrap());

        let parser = Arc::new(TeardownParser {
            inner: StaticParser::new(1),
            page: Latch::new(),
            events: events.clone(),
        });
        let _host = RemoteHost::new(worker, parser.clone()).unwrap();
        let transport = DocumentTransport::new(main.clone(), OpenParams::new(DocumentSource::Stream(source))).unwrap();

        transport.open().await.unwrap();
        let page = transport.get_page(0).await.unwrap();
        parser.page.set(page.clone());

        assert_eq!(transport.destroy().await, Ok(()));
        assert_eq!(*events.lock().unwrap(), vec!["page destroyed", "terminated", "source cancelled"]);
        assert!(main.is_destroyed());
        assert!(parser.inner.is_terminated());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (transport, _parser, _host) = setup(StaticParser::new(1), OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-"))));
        transport.open().await.unwrap();
        let page = transport.get_page(0).await.unwrap();

        let (first, second) = tokio::join!(transport.destroy(), transport.destroy());
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(transport.destroy().await, Ok(()));

        assert!(page.is_destroyed());
        assert!(transport.get_page(0).await.unwrap_err().is_abort());
    }

    #[tokio::test]
    async fn test_destroy_after_remote_side_is_gone() {
        let (main, worker) = loopback_endpoints();
        let transport = DocumentTransport::new(main, OpenParams::new(DocumentSource::Data(Bytes::from_static(b"%PDF-")))).unwrap();
        worker.destroy();
        drop(worker);

        let outcome = tokio::time::timeout(Duration::from_secs(1), transport.destroy()).await.unwrap();
        assert!(outcome.is_err());
        assert_eq!(transport.phase(), TransportPhase::Destroyed);
    }
}
