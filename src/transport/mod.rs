//! The document level protocol on top of [crate::rpc]: the main side's [document::DocumentTransport]
//!  and the remote side's [remote::RemoteHost] that adapts the protocol onto a parser.
//!
//! Main side handlers, called by the remote side:
//!  * `GetReader` (stream) - the full reader's bytes, one read per pull
//!  * `GetRangeReader` (stream) - a range's bytes, closed right away if the full reader already
//!    delivered them
//!  * `ReaderHeadersReady` (call) - the full reader's metadata once it is known
//!  * `PasswordRequest` (call) - asks the application for a password
//!
//! Remote side handlers, called by the main side:
//!  * `OpenDocument`, `GetPage`, `Terminate` (calls)
//!  * `GetOperatorList` (stream) - a page's drawing program for an intent, in chunks

pub mod document;
pub mod operator_list;
pub mod page;
pub mod remote;
pub mod remote_stream;

pub const ACTION_GET_READER: &str = "GetReader";
pub const ACTION_GET_RANGE_READER: &str = "GetRangeReader";
pub const ACTION_READER_HEADERS_READY: &str = "ReaderHeadersReady";
pub const ACTION_PASSWORD_REQUEST: &str = "PasswordRequest";

pub const ACTION_OPEN_DOCUMENT: &str = "OpenDocument";
pub const ACTION_GET_PAGE: &str = "GetPage";
pub const ACTION_GET_OPERATOR_LIST: &str = "GetOperatorList";
pub const ACTION_TERMINATE: &str = "Terminate";

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use bytes::Bytes;
    use crate::channel::framed::FramedChannel;
    use crate::config::{EndpointConfig, SourceConfig, TransportConfig};
    use crate::render::SurfaceSlot;
    use crate::rpc::endpoint::RpcEndpoint;
    use crate::source::fs::FileByteSource;
    use crate::source::http::HttpByteSource;
    use crate::test_util::http_server::{serve_document, ServedDocument};
    use crate::test_util::{loopback_endpoints, RecordingSurface, StaticParser};
    use crate::transport::document::{DocumentSource, DocumentTransport, OpenParams, TransportPhase};
    use crate::transport::operator_list::RenderIntent;
    use crate::transport::remote::RemoteHost;

    fn document(len: usize) -> Bytes {
        let mut data = b"%PDF-1.7\n".to_vec();
        data.extend((data.len()..len).map(|i| (i % 251) as u8));
        data.into()
    }

    async fn open_and_render(transport: &DocumentTransport) -> usize {
        transport.open().await.unwrap();
        let page = transport.get_page(1).await.unwrap();
        let surface = RecordingSurface::new();
        let slot = SurfaceSlot::new(surface.clone());
        let task = page.render(RenderIntent::Display, &slot).unwrap();
        task.completion().await.unwrap();
        surface.executed_operators()
    }

    #[tokio::test]
    async fn test_local_file_end_to_end() {
        let data = document(200_000);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let (main, worker) = loopback_endpoints();
        let parser = Arc::new(StaticParser::new(2).with_operators(50, 7));
        let host = RemoteHost::new(worker, parser.clone()).unwrap();

        let source = Arc::new(FileByteSource::new(file.path(), SourceConfig::default()).unwrap());
        let transport = DocumentTransport::new(main, OpenParams::new(DocumentSource::Stream(source))).unwrap();

        assert_eq!(open_and_render(&transport).await, 50);
        assert_eq!(parser.loaded_length(), Some(200_000));
        assert_eq!(transport.info().unwrap().length, 200_000);

        assert_eq!(transport.destroy().await, Ok(()));
        assert_eq!(transport.phase(), TransportPhase::Destroyed);
        assert!(host.is_terminated());
    }

    #[tokio::test]
    async fn test_http_origin_end_to_end() {
        let data = document(10_000);
        let server = serve_document(ServedDocument::new(data.clone()).with_filename("report.pdf")).await.unwrap();

        let (main, worker) = loopback_endpoints();
        let parser = Arc::new(StaticParser::new(3));
        let _host = RemoteHost::new(worker, parser.clone()).unwrap();

        let config = TransportConfig {
            source: SourceConfig { range_chunk_size: 1024, ..Default::default() },
            ..Default::default()
        };
        let source = Arc::new(HttpByteSource::new(&server.url("/doc.pdf"), config.source.clone()).unwrap());
        let params = OpenParams::new(DocumentSource::Stream(source)).with_config(config);
        let transport = DocumentTransport::new(main, params).unwrap();

        assert_eq!(open_and_render(&transport).await, 10);
        assert_eq!(parser.loaded_length(), Some(10_000));

        let headers = transport.source_headers().unwrap();
        assert_eq!(headers.content_length, Some(10_000));
        assert!(headers.is_range_supported);
        assert_eq!(headers.filename, Some("report.pdf".to_string()));
        assert_eq!(transport.destroy().await, Ok(()));
    }

    #[tokio::test]
    async fn test_framed_channel_end_to_end() {
        let (a, b) = FramedChannel::duplex_pair(64 * 1024);
        let main = RpcEndpoint::new(EndpointConfig::main(), a).unwrap();
        let worker = RpcEndpoint::new(EndpointConfig::worker(), b).unwrap();
        let _host = RemoteHost::new(worker, Arc::new(StaticParser::new(2).with_operators(300, 16))).unwrap();

        let transport = DocumentTransport::new(main, OpenParams::new(DocumentSource::Data(document(5_000)))).unwrap();
        assert_eq!(open_and_render(&transport).await, 300);
        assert_eq!(transport.destroy().await, Ok(()));
    }
}
