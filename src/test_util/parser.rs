use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHasher;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{DocError, PasswordCode};
use crate::transport::operator_list::{OperatorListChunk, RenderIntent};
use crate::transport::remote::{DocumentBytes, DocumentInfo, DocumentParser, OperatorListSink, PageInfo};
use crate::util::latch::Latch;

/// A [DocumentParser] for tests: every page has the same number of operators, sent in chunks of
///  a fixed size. Failures and stalls can be switched on per request kind, and the parser counts
///  what it was asked to do.
pub struct StaticParser {
    num_pages: u32,
    operators: usize,
    chunk_size: usize,
    password: Option<String>,
    stalled_pages: bool,
    pages_held_until_terminate: bool,
    failing_operator_lists: bool,
    stalled_operator_lists: bool,

    loaded: OnceCell<Bytes>,
    page_requests: AtomicUsize,
    operator_list_requests: AtomicUsize,
    cancelled_operator_lists: AtomicUsize,
    terminated: AtomicBool,
    released: Latch<()>,
}

impl StaticParser {
    pub fn new(num_pages: u32) -> StaticParser {
        StaticParser {
            num_pages,
            operators: 10,
            chunk_size: 10,
            password: None,
            stalled_pages: false,
            pages_held_until_terminate: false,
            failing_operator_lists: false,
            stalled_operator_lists: false,
            loaded: OnceCell::new(),
            page_requests: AtomicUsize::new(0),
            operator_list_requests: AtomicUsize::new(0),
            cancelled_operator_lists: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            released: Latch::new(),
        }
    }

    pub fn with_operators(mut self, operators: usize, chunk_size: usize) -> StaticParser {
        self.operators = operators;
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_password(mut self, password: &str) -> StaticParser {
        self.password = Some(password.to_string());
        self
    }

    /// page requests never complete
    pub fn with_stalled_pages(mut self) -> StaticParser {
        self.stalled_pages = true;
        self
    }

    /// page requests complete only once the parser is terminated, and terminating waits a little
    ///  so their replies go out first
    pub fn with_pages_held_until_terminate(mut self) -> StaticParser {
        self.pages_held_until_terminate = true;
        self
    }

    pub fn with_failing_operator_lists(mut self) -> StaticParser {
        self.failing_operator_lists = true;
        self
    }

    /// operator lists send their first chunk and then never complete
    pub fn with_stalled_operator_lists(mut self) -> StaticParser {
        self.stalled_operator_lists = true;
        self
    }

    /// the length of the document's bytes, once they were loaded
    pub fn loaded_length(&self) -> Option<usize> {
        self.loaded.get().map(|b| b.len())
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn operator_list_requests(&self) -> usize {
        self.operator_list_requests.load(Ordering::SeqCst)
    }

    /// operator lists that were abandoned because the main side cancelled them
    pub fn cancelled_operator_lists(&self) -> usize {
        self.cancelled_operator_lists.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn load(bytes: DocumentBytes) -> Result<Bytes, DocError> {
        match bytes {
            DocumentBytes::Data(data) => Ok(data),
            DocumentBytes::Stream(source) => {
                let reader = source.get_full_reader()
                    .map_err(|e| DocError::unknown("loading the document failed", e.to_string()))?;
                let mut buf = BytesMut::new();
                while let Some(chunk) = reader.read().await? {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }

    fn check_password(&self, password: Option<&str>) -> Result<(), DocError> {
        let Some(expected) = &self.password else {
            return Ok(());
        };
        match password {
            None => Err(DocError::Password { message: "No password given".to_string(), code: PasswordCode::NeedPassword }),
            Some(p) if p == expected => Ok(()),
            Some(_) => Err(DocError::Password { message: "Incorrect Password".to_string(), code: PasswordCode::IncorrectPassword }),
        }
    }
}

/// Counts the operator list as cancelled unless it is disarmed: a request that is aborted
///  mid-way drops it armed.
struct CancelGuard<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DocumentParser for StaticParser {
    async fn open(&self, bytes: DocumentBytes, password: Option<String>) -> Result<DocumentInfo, DocError> {
        let data = self.loaded.get_or_try_init(|| StaticParser::load(bytes)).await?;
        if data.is_empty() {
            return Err(DocError::invalid_document("Invalid PDF structure."));
        }
        self.check_password(password.as_deref())?;

        let mut hasher = FxHasher::default();
        hasher.write(data);
        Ok(DocumentInfo {
            num_pages: self.num_pages,
            fingerprint: format!("{:016x}", hasher.finish()),
            length: data.len() as u64,
        })
    }

    async fn get_page(&self, page_index: u32) -> Result<PageInfo, DocError> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        if self.stalled_pages {
            futures::future::pending::<()>().await;
        }
        if self.pages_held_until_terminate {
            self.released.wait().await;
        }
        if page_index >= self.num_pages {
            return Err(DocError::unknown("Invalid page request", format!("page index {}", page_index)));
        }
        Ok(PageInfo {
            page_index,
            rotate: 0,
            view: [0.0, 0.0, 612.0, 792.0],
        })
    }

    async fn operator_list(&self, page_index: u32, intent: RenderIntent, sink: OperatorListSink) -> Result<(), DocError> {
        self.operator_list_requests.fetch_add(1, Ordering::SeqCst);
        if self.failing_operator_lists {
            return Err(DocError::invalid_document(format!("page {} has broken content", page_index)));
        }

        let mut guard = CancelGuard { counter: &self.cancelled_operator_lists, armed: true };
        let mut sent = 0;
        while sent < self.operators {
            let len = self.chunk_size.min(self.operators - sent);
            sent += len;
            let last_chunk = sent == self.operators;
            sink.send(OperatorListChunk {
                fn_array: vec![page_index; len],
                args_array: vec![Value::Null; len],
                last_chunk,
            }).await?;

            if self.stalled_operator_lists {
                debug!(page_index, %intent, "stalling operator list");
                futures::future::pending::<()>().await;
            }
        }
        guard.armed = false;
        Ok(())
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if self.released.set(()) && self.pages_held_until_terminate {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
