//! Utilities for testing code built on docwire: connected endpoints, an in-memory origin, a
//!  local http server, a scriptable parser and a recording drawing surface. They are used for
//!  testing docwire itself, but they are also exported for application testing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use hyper::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE};
use hyper::HeaderMap;
use tokio::sync::mpsc;

use crate::channel::loopback::LoopbackChannel;
use crate::config::EndpointConfig;
use crate::rpc::endpoint::RpcEndpoint;
use crate::source::origin::{ByteOriginClient, OriginConnection, OriginEvent, OriginRequest};

pub mod http_server;
pub mod parser;
pub mod surface;

pub use parser::StaticParser;
pub use surface::{RecordingSurface, SurfaceEvent};

/// A main side and a worker side endpoint, connected by a [LoopbackChannel]. Must be called
///  from inside a tokio runtime.
pub fn loopback_endpoints() -> (RpcEndpoint, RpcEndpoint) {
    let (a, b) = LoopbackChannel::pair();
    let main = RpcEndpoint::new(EndpointConfig::main(), a)
        .expect("the main side config is valid");
    let worker = RpcEndpoint::new(EndpointConfig::worker(), b)
        .expect("the worker side config is valid");
    (main, worker)
}

/// Polls `condition` until it holds, panicking if it does not within two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not become true in time");
}

/// A [ByteOriginClient] serving a document from memory: full requests get the whole document
///  in chunks of `chunk_size`, range requests get their slice. All events are available right
///  away.
pub struct MemoryOriginClient {
    data: Bytes,
    chunk_size: usize,
    requests: Mutex<Vec<Option<(u64, u64)>>>,
}

impl MemoryOriginClient {
    pub fn new(data: Bytes, chunk_size: usize) -> MemoryOriginClient {
        MemoryOriginClient {
            data,
            chunk_size: chunk_size.max(1),
            requests: Default::default(),
        }
    }

    /// the range of every request so far, `None` for full requests
    pub fn requests(&self) -> Vec<Option<(u64, u64)>> {
        self.requests.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ByteOriginClient for MemoryOriginClient {
    fn open(&self, request: OriginRequest) -> OriginConnection {
        self.requests.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.range);

        let (sender, events) = mpsc::unbounded_channel();
        let len = self.data.len() as u64;

        let (status, body) = match request.range {
            None => (200, self.data.clone()),
            Some((begin, end)) => {
                let end = end.min(len);
                let begin = begin.min(end);
                (206, self.data.slice(begin as usize..end as usize))
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some((begin, end)) = request.range {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", begin, end.saturating_sub(1), len)) {
                headers.insert(CONTENT_RANGE, value);
            }
        }

        // NB: the receiver is owned by the connection, so these sends can not fail
        let _ = sender.send(OriginEvent::Headers { status, headers });
        for chunk in body.chunks(self.chunk_size) {
            let _ = sender.send(OriginEvent::Chunk(body.slice_ref(chunk)));
        }
        let _ = sender.send(OriginEvent::End);

        OriginConnection {
            events,
            abort: Box::new(|| {}),
        }
    }
}
