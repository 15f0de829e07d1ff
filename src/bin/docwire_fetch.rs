use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
use clap::Parser;
use rustc_hash::FxHasher;
use docwire::channel::loopback::LoopbackChannel;
use docwire::config::{EndpointConfig, SourceConfig, TransportConfig, DEFAULT_RANGE_CHUNK_SIZE};
use docwire::error::DocError;
use docwire::rpc::endpoint::RpcEndpoint;
use docwire::source::fs::FileByteSource;
use docwire::source::http::HttpByteSource;
use docwire::source::{ByteSource, Progress};
use docwire::transport::document::{DocumentSource, DocumentTransport, OpenParams};
use docwire::transport::operator_list::{OperatorListChunk, RenderIntent};
use docwire::transport::remote::{DocumentBytes, DocumentInfo, DocumentParser, OperatorListSink, PageInfo, RemoteHost};
use tracing::{debug, info, Level};

/// Fetches a document through the document transport and reports what the origin said about it
#[derive(Parser)]
struct Args {
    /// a local file or an http url
    location: String,

    #[clap(long, default_value_t = DEFAULT_RANGE_CHUNK_SIZE)]
    range_chunk_size: u64,

    #[clap(long, default_value_t = false)]
    disable_range: bool,

    #[clap(long, default_value_t = false)]
    disable_stream: bool,

    #[clap(long)]
    header: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut http_headers = Vec::new();
    for h in &args.header {
        let (name, value) = h.split_once(':')
            .ok_or_else(|| anyhow!("header {:?} is not of the form 'name: value'", h))?;
        http_headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let source_config = SourceConfig {
        range_chunk_size: args.range_chunk_size,
        disable_range: args.disable_range,
        disable_stream: args.disable_stream,
        http_headers,
        ..Default::default()
    };

    let source: Arc<dyn ByteSource> = if args.location.starts_with("http://") {
        Arc::new(HttpByteSource::new(&args.location, source_config.clone())?)
    }
    else {
        Arc::new(FileByteSource::new(PathBuf::from(&args.location), source_config.clone())?)
    };

    let (main_channel, worker_channel) = LoopbackChannel::pair();
    let main = RpcEndpoint::new(EndpointConfig::main(), main_channel)?;
    let worker = RpcEndpoint::new(EndpointConfig::worker(), worker_channel)?;
    let _host = RemoteHost::new(worker, Arc::new(ByteCountingParser))?;

    let params = OpenParams::new(DocumentSource::Stream(source))
        .with_config(TransportConfig { source: source_config, ..Default::default() })
        .with_progress(Arc::new(|progress: Progress| {
            debug!(loaded = progress.loaded, total = ?progress.total, "progress");
        }));
    let transport = DocumentTransport::new(main, params)?;

    let opened = transport.open().await;
    let headers = transport.source_headers().unwrap_or_default();
    transport.destroy().await?;
    let info = opened?;

    println!("length:          {}", info.length);
    println!("pages:           {}", info.num_pages);
    println!("fingerprint:     {}", info.fingerprint);
    println!("range support:   {}", headers.is_range_supported);
    println!("streaming:       {}", headers.is_streaming_supported);
    println!("filename:        {}", headers.filename.as_deref().unwrap_or("-"));
    Ok(())
}

/// Reads the whole document and counts its page objects, without parsing anything
struct ByteCountingParser;

const PAGE_MARKER: &[u8] = b"/Type /Page";

impl ByteCountingParser {
    fn count_pages(data: &[u8]) -> u32 {
        data.windows(PAGE_MARKER.len() + 1)
            .filter(|w| w.starts_with(PAGE_MARKER) && w[PAGE_MARKER.len()] != b's')
            .count() as u32
    }
}

#[async_trait]
impl DocumentParser for ByteCountingParser {
    async fn open(&self, bytes: DocumentBytes, _password: Option<String>) -> Result<DocumentInfo, DocError> {
        let data = match bytes {
            DocumentBytes::Data(data) => data,
            DocumentBytes::Stream(source) => {
                let reader = source.get_full_reader()
                    .map_err(|e| DocError::unknown("no full reader", e.to_string()))?;
                let mut buf = BytesMut::new();
                while let Some(chunk) = reader.read().await? {
                    buf.extend_from_slice(&chunk);
                }
                info!(loaded = buf.len(), "document loaded");
                buf.freeze()
            }
        };

        if !data.starts_with(b"%PDF-") {
            return Err(DocError::invalid_document("Invalid PDF structure."));
        }
        Ok(DocumentInfo {
            num_pages: Self::count_pages(&data),
            fingerprint: format!("{:016x}", fingerprint(&data)),
            length: data.len() as u64,
        })
    }

    async fn get_page(&self, page_index: u32) -> Result<PageInfo, DocError> {
        Ok(PageInfo { page_index, rotate: 0, view: [0.0, 0.0, 612.0, 792.0] })
    }

    async fn operator_list(&self, _page_index: u32, _intent: RenderIntent, sink: OperatorListSink) -> Result<(), DocError> {
        sink.send(OperatorListChunk { fn_array: Vec::new(), args_array: Vec::new(), last_chunk: true }).await
    }

    async fn terminate(&self) {}
}

fn fingerprint(data: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data);
    hasher.finish()
}
