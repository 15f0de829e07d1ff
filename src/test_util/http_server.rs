//! A local http server serving a single document, with optional range support.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The path the document is served at
pub const DOCUMENT_PATH: &str = "/doc.pdf";

#[derive(Clone, Debug)]
pub struct ServedDocument {
    data: Bytes,
    filename: Option<String>,
    range_support: bool,
}

impl ServedDocument {
    pub fn new(data: Bytes) -> ServedDocument {
        ServedDocument {
            data,
            filename: None,
            range_support: true,
        }
    }

    /// sent as `Content-Disposition: attachment; filename="..."`
    pub fn with_filename(mut self, filename: &str) -> ServedDocument {
        self.filename = Some(filename.to_string());
        self
    }

    /// no `Accept-Ranges` header, and `Range` headers are ignored
    pub fn without_range_support(mut self) -> ServedDocument {
        self.range_support = false;
        self
    }
}

/// A running server. It is shut down when this handle is dropped.
pub struct DocumentServer {
    addr: SocketAddr,
    range_requests: Arc<Mutex<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl DocumentServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// the `Range` header of every ranged request received so far
    pub fn range_requests(&self) -> Vec<String> {
        self.range_requests.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for DocumentServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// Starts serving `document` on an ephemeral localhost port
pub async fn serve_document(document: ServedDocument) -> anyhow::Result<DocumentServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    info!("serving test document on http://{}", addr);

    let range_requests = Arc::new(Mutex::new(Vec::new()));
    let document = Arc::new(document);

    let requests = range_requests.clone();
    let accept_loop = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(e) => {
                    error!("error accepting connection: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);

            let document = document.clone();
            let requests = requests.clone();
            let service = service_fn(move |req| {
                let document = document.clone();
                let requests = requests.clone();
                async move { Ok::<_, Infallible>(respond(&document, &requests, req)) }
            });

            tokio::spawn(async move {
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("error serving connection: {:?}", err);
                }
            });
        }
    });

    Ok(DocumentServer { addr, range_requests, accept_loop })
}

fn respond(document: &ServedDocument, range_requests: &Mutex<Vec<String>>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.uri().path() != DOCUMENT_PATH {
        return status_response(StatusCode::NOT_FOUND);
    }

    let range = req.headers().get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut response = match range {
        Some(range) if document.range_support => {
            range_requests.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(range.clone());

            let Some((begin, end)) = parse_range(&range, document.data.len()) else {
                return status_response(StatusCode::RANGE_NOT_SATISFIABLE);
            };
            let mut response = Response::new(Full::new(document.data.slice(begin..end)));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", begin, end - 1, document.data.len())) {
                response.headers_mut().insert(CONTENT_RANGE, value);
            }
            response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(end - begin));
            response
        }
        _ => {
            let mut response = Response::new(Full::new(document.data.clone()));
            response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(document.data.len()));
            response
        }
    };

    let headers = response.headers_mut();
    if document.range_support {
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Some(filename) = &document.filename {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
    }
    response
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

/// `bytes=first-last` with an inclusive `last` -> `[begin, end)`, clamped to the document
fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let (first, last) = header.strip_prefix("bytes=")?.split_once('-')?;
    let begin: usize = first.trim().parse().ok()?;
    let end = match last.trim() {
        "" => len,
        last => last.parse::<usize>().ok()?.saturating_add(1).min(len),
    };
    (begin < end).then_some((begin, end))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::closed("bytes=10-19", Some((10, 20)))]
    #[case::open_ended("bytes=90-", Some((90, 100)))]
    #[case::clamped("bytes=95-200", Some((95, 100)))]
    #[case::beyond_end("bytes=100-120", None)]
    #[case::no_unit("10-19", None)]
    fn test_parse_range(#[case] header: &str, #[case] expected: Option<(usize, usize)>) {
        assert_eq!(parse_range(header, 100), expected);
    }
}
