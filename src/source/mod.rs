//! Byte sources: where a document's bytes come from, independent of the origin.
//!
//! Every source hands out one [FullReader] (sequential from offset 0, negotiating capabilities
//!  once the origin's metadata is known) and any number of range readers for `[begin, end)`
//!  windows. Callers never branch on the concrete backend:
//!  * [fs::FileByteSource] for local files
//!  * [http::HttpByteSource] for http origins, using a native client with range support
//!  * [origin::OriginByteSource] wrapping a host supplied [origin::ByteOriginClient]
//!  * [range_transport::RangeTransportSource] for data pushed by an embedding application

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::DocError;

pub mod fs;
pub mod http;
pub mod network_utils;
pub mod origin;
pub mod range_transport;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

#[async_trait]
pub trait ByteReader: Send + Sync {
    /// The next chunk, or `None` at the end. Once the reader is cancelled, pending and later
    ///  reads return `None`.
    async fn read(&self) -> Result<Option<Bytes>, DocError>;

    /// Stops reading and releases the underlying request. Cancelling more than once, or after
    ///  the reader completed, has no effect.
    fn cancel(&self, reason: DocError);

    fn set_on_progress(&self, callback: ProgressCallback);
}

#[async_trait]
pub trait FullReader: ByteReader {
    /// Resolves once the origin's metadata is known. The getters below return their final values
    ///  only after that.
    async fn headers_ready(&self) -> Result<(), DocError>;

    fn content_length(&self) -> Option<u64>;

    /// `false` until proven otherwise
    fn is_range_supported(&self) -> bool;

    fn is_streaming_supported(&self) -> bool;

    /// the file name suggested by the origin, if it names a PDF file
    fn filename(&self) -> Option<String>;
}

pub trait ByteSource: Send + Sync {
    /// There is exactly one full reader per source; asking for a second one is a bug in the
    ///  caller and fails.
    fn get_full_reader(&self) -> anyhow::Result<Arc<dyn FullReader>>;

    /// `None` if `[begin, end)` is empty or was already delivered by the full reader.
    fn get_range_reader(&self, begin: u64, end: u64) -> Option<Arc<dyn ByteReader>>;

    /// bytes delivered by the full reader so far
    fn progressive_data_length(&self) -> u64;

    /// Cancels the full reader and every range reader that is still around. Idempotent.
    fn cancel_all_requests(&self, reason: DocError);
}

#[derive(Default)]
struct ReaderSetState {
    full_reader: Option<Arc<dyn FullReader>>,
    full_reader_taken: bool,
    range_readers: Vec<Weak<dyn ByteReader>>,
    cancelled: Option<DocError>,
}

/// Book keeping shared by the source backends: the singleton full reader, the outstanding range
///  readers for cancellation, and the progressive length.
#[derive(Default)]
pub struct ReaderSet {
    state: Mutex<ReaderSetState>,
    progressive_loaded: Arc<AtomicU64>,
}

impl ReaderSet {
    fn state(&self) -> MutexGuard<'_, ReaderSetState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// the counter a full reader advances for every byte it delivers
    pub fn progressive_counter(&self) -> Arc<AtomicU64> {
        self.progressive_loaded.clone()
    }

    pub fn progressive_data_length(&self) -> u64 {
        self.progressive_loaded.load(Ordering::Acquire)
    }

    pub fn claim_full_reader(&self, create: impl FnOnce() -> Arc<dyn FullReader>) -> anyhow::Result<Arc<dyn FullReader>> {
        let mut state = self.state();
        if state.full_reader_taken {
            bail!("the full reader can only be requested once per byte source");
        }
        state.full_reader_taken = true;

        let reader = create();
        if let Some(reason) = &state.cancelled {
            reader.cancel(reason.clone());
        }
        state.full_reader = Some(reader.clone());
        Ok(reader)
    }

    /// `true` if a range ending at `end` would only repeat bytes the full reader already delivered
    pub fn is_already_delivered(&self, end: u64) -> bool {
        end <= self.progressive_data_length()
    }

    pub fn add_range_reader(&self, reader: Arc<dyn ByteReader>) -> Arc<dyn ByteReader> {
        let mut state = self.state();
        state.range_readers.retain(|r| r.strong_count() > 0);
        if let Some(reason) = &state.cancelled {
            reader.cancel(reason.clone());
        }
        state.range_readers.push(Arc::downgrade(&reader));
        reader
    }

    pub fn cancel_all(&self, reason: DocError) {
        let (full_reader, range_readers) = {
            let mut state = self.state();
            if state.cancelled.is_none() {
                state.cancelled = Some(reason.clone());
            }
            (state.full_reader.clone(), std::mem::take(&mut state.range_readers))
        };

        debug!(range_readers = range_readers.len(), %reason, "cancelling all requests");
        if let Some(reader) = full_reader {
            reader.cancel(reason.clone());
        }
        for reader in range_readers.iter().filter_map(|r| r.upgrade()) {
            reader.cancel(reason.clone());
        }
    }
}

struct ChunkQueueState {
    chunks: VecDeque<Bytes>,
    end: Option<Result<(), DocError>>,
}

/// Chunks pushed by a producer (a host callback, a pump task) waiting to be read. The queue
///  ends once: regularly, with an error, or by cancellation which also drops queued chunks.
pub struct ChunkQueue {
    state: Mutex<ChunkQueueState>,
    notify: Notify,
}

impl Default for ChunkQueue {
    fn default() -> Self {
        ChunkQueue {
            state: Mutex::new(ChunkQueueState {
                chunks: VecDeque::new(),
                end: None,
            }),
            notify: Notify::new(),
        }
    }
}

impl ChunkQueue {
    fn state(&self) -> MutexGuard<'_, ChunkQueueState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// returns `false` and drops the chunk if the queue already ended
    pub fn push(&self, chunk: Bytes) -> bool {
        {
            let mut state = self.state();
            if state.end.is_some() {
                return false;
            }
            state.chunks.push_back(chunk);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn finish(&self) {
        self.end(Ok(()), false);
    }

    pub fn fail(&self, reason: DocError) {
        self.end(Err(reason), false);
    }

    pub fn cancel(&self) {
        self.end(Ok(()), true);
    }

    fn end(&self, end: Result<(), DocError>, discard_queued: bool) {
        {
            let mut state = self.state();
            if discard_queued {
                state.chunks.clear();
            }
            if state.end.is_none() {
                state.end = Some(end);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn is_ended(&self) -> bool {
        self.state().end.is_some()
    }

    pub async fn next(&self) -> Result<Option<Bytes>, DocError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(chunk) = state.chunks.pop_front() {
                    return Ok(Some(chunk));
                }
                match &state.end {
                    Some(Ok(())) => return Ok(None),
                    Some(Err(e)) => return Err(e.clone()),
                    None => {}
                }
            }

            notified.await;
        }
    }
}

/// The progress callback slot every reader has
#[derive(Default)]
pub struct ProgressSlot {
    callback: Mutex<Option<ProgressCallback>>,
}

impl ProgressSlot {
    pub fn set(&self, callback: ProgressCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn report(&self, loaded: u64, total: Option<u64>) {
        let callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(Progress { loaded, total });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use super::*;

    #[derive(Default)]
    struct CountingReader {
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl ByteReader for CountingReader {
        async fn read(&self) -> Result<Option<Bytes>, DocError> {
            Ok(None)
        }
        fn cancel(&self, _reason: DocError) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        fn set_on_progress(&self, _callback: ProgressCallback) {}
    }

    #[async_trait]
    impl FullReader for CountingReader {
        async fn headers_ready(&self) -> Result<(), DocError> {
            Ok(())
        }
        fn content_length(&self) -> Option<u64> {
            None
        }
        fn is_range_supported(&self) -> bool {
            false
        }
        fn is_streaming_supported(&self) -> bool {
            true
        }
        fn filename(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_full_reader_only_once() {
        let readers = ReaderSet::default();
        assert!(readers.claim_full_reader(|| Arc::new(CountingReader::default())).is_ok());
        assert!(readers.claim_full_reader(|| Arc::new(CountingReader::default())).is_err());
    }

    #[test]
    fn test_cancel_all_reaches_live_readers_only() {
        let readers = ReaderSet::default();
        let full = Arc::new(CountingReader::default());
        let full2 = full.clone();
        readers.claim_full_reader(move || full2).unwrap();

        let live = Arc::new(CountingReader::default());
        readers.add_range_reader(live.clone());
        let dropped: Arc<dyn ByteReader> = Arc::new(CountingReader::default());
        readers.add_range_reader(dropped);

        readers.cancel_all(DocError::abort("destroy"));
        readers.cancel_all(DocError::abort("again"));
        assert_eq!(full.cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(live.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_readers_after_cancel_are_cancelled_right_away() {
        let readers = ReaderSet::default();
        readers.cancel_all(DocError::abort("destroy"));

        let late = Arc::new(CountingReader::default());
        readers.add_range_reader(late.clone());
        assert_eq!(late.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_already_delivered() {
        let readers = ReaderSet::default();
        readers.progressive_counter().store(1200, Ordering::Release);
        assert!(readers.is_already_delivered(1000));
        assert!(readers.is_already_delivered(1200));
        assert!(!readers.is_already_delivered(1500));
    }

    #[tokio::test]
    async fn test_chunk_queue_drains_before_end() {
        let queue = ChunkQueue::default();
        queue.push(Bytes::from_static(b"a"));
        queue.push(Bytes::from_static(b"b"));
        queue.finish();
        assert!(!queue.push(Bytes::from_static(b"c")));

        assert_eq!(queue.next().await, Ok(Some(Bytes::from_static(b"a"))));
        assert_eq!(queue.next().await, Ok(Some(Bytes::from_static(b"b"))));
        assert_eq!(queue.next().await, Ok(None));
    }

    #[tokio::test]
    async fn test_chunk_queue_wakes_reader() {
        let queue = Arc::new(ChunkQueue::default());
        let queue2 = queue.clone();
        let reader = tokio::spawn(async move { queue2.next().await });
        tokio::task::yield_now().await;

        queue.push(Bytes::from_static(b"x"));
        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result, Ok(Some(Bytes::from_static(b"x"))));
    }

    #[tokio::test]
    async fn test_chunk_queue_cancel_resolves_pending_read() {
        let queue = Arc::new(ChunkQueue::default());
        let queue2 = queue.clone();
        let reader = tokio::spawn(async move { queue2.next().await });
        tokio::task::yield_now().await;

        queue.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_chunk_queue_error() {
        let queue = ChunkQueue::default();
        queue.push(Bytes::from_static(b"a"));
        queue.fail(DocError::abort("x"));
        assert_eq!(queue.next().await, Ok(Some(Bytes::from_static(b"a"))));
        assert_eq!(queue.next().await, Err(DocError::abort("x")));
    }
}
