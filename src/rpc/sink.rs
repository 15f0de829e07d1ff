use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::bail;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::DocError;
use crate::rpc::endpoint::EndpointInner;
use crate::rpc::message::{MessageBody, Payload, StreamOp};

pub type PullHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), DocError>> + Send + Sync>;
pub type CancelHook = Box<dyn FnOnce(DocError) -> BoxFuture<'static, Result<(), DocError>> + Send>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SinkPhase {
    Open,
    /// closed or errored by the producer
    Closed,
    /// cancelled by the consumer, or the endpoint went away
    Cancelled,
}

#[derive(Debug, Clone)]
enum Readiness {
    Ready,
    Blocked,
    Closed,
    Cancelled(DocError),
}

struct SinkState {
    desired_size: i64,
    phase: SinkPhase,
    on_pull: Option<PullHook>,
    on_cancel: Option<CancelHook>,
}

struct SinkShared {
    stream_id: u64,
    endpoint: Weak<EndpointInner>,
    state: Mutex<SinkState>,
    readiness: watch::Sender<Readiness>,
}

/// The producer's handle for a stream, passed to the handler registered with
///  [crate::rpc::endpoint::RpcEndpoint::on_stream].
///
/// Every [StreamSink::enqueue] decrements the desired size by the chunk's size. Once it drops
///  to or below zero, [StreamSink::ready] stays pending until the consumer's next pull raises it
///  again. Producers are expected to await `ready()` before each enqueue.
#[derive(Clone)]
pub struct StreamSink {
    shared: Arc<SinkShared>,
}

impl Debug for StreamSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        write!(f, "StreamSink{{id:{}, desired_size:{}, phase:{:?}}}", self.shared.stream_id, state.desired_size, state.phase)
    }
}

impl StreamSink {
    pub(crate) fn new(stream_id: u64, endpoint: Weak<EndpointInner>, desired_size: i64) -> StreamSink {
        let initial = if desired_size > 0 { Readiness::Ready } else { Readiness::Blocked };
        let (readiness, _) = watch::channel(initial);
        StreamSink {
            shared: Arc::new(SinkShared {
                stream_id,
                endpoint,
                state: Mutex::new(SinkState {
                    desired_size,
                    phase: SinkPhase::Open,
                    on_pull: None,
                    on_cancel: None,
                }),
                readiness,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.shared.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stream_id(&self) -> u64 {
        self.shared.stream_id
    }

    pub fn desired_size(&self) -> i64 {
        self.state().desired_size
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().phase == SinkPhase::Cancelled
    }

    /// Resolves once the desired size is positive. Rejects with the consumer's reason if the
    ///  stream was cancelled; resolves immediately after the sink was closed.
    pub async fn ready(&self) -> Result<(), DocError> {
        let mut receiver = self.shared.readiness.subscribe();
        let readiness = match receiver.wait_for(|r| !matches!(r, Readiness::Blocked)).await {
            Ok(r) => r.clone(),
            Err(_) => Readiness::Closed,
        };
        match readiness {
            Readiness::Cancelled(reason) => Err(reason),
            _ => Ok(()),
        }
    }

    /// Sends a chunk to the consumer. This does not wait for backpressure and does not refuse a
    ///  chunk when [StreamSink::desired_size] is zero or less: keeping the consumer's queue within
    ///  its high water mark is the producer's job, either by awaiting [StreamSink::ready] before
    ///  each chunk or by enqueueing only from the `on_pull` hook.
    ///
    /// Enqueueing after the consumer cancelled is a no-op. Enqueueing after this sink was closed
    ///  is a bug in the producer and returns `Err`.
    pub fn enqueue(&self, chunk: Payload, size: i64) -> anyhow::Result<()> {
        let mut state = self.state();
        match state.phase {
            SinkPhase::Cancelled => {
                trace!(stream_id = self.shared.stream_id, "enqueue on a cancelled sink - ignoring");
                return Ok(());
            }
            SinkPhase::Closed => bail!("stream {}: enqueue after close", self.shared.stream_id),
            SinkPhase::Open => {}
        }

        let Some(endpoint) = self.shared.endpoint.upgrade() else {
            trace!(stream_id = self.shared.stream_id, "endpoint is gone - dropping chunk");
            return Ok(());
        };

        let last_desired_size = state.desired_size;
        state.desired_size -= size;
        if last_desired_size > 0 && state.desired_size <= 0 {
            self.shared.readiness.send_replace(Readiness::Blocked);
        }

        trace!(stream_id = self.shared.stream_id, size, desired_size = state.desired_size, "enqueue");
        endpoint.post(MessageBody::Stream { stream_id: self.shared.stream_id, op: StreamOp::Enqueue { chunk, size } })
    }

    pub fn close(&self) {
        self.finish(StreamOp::Close);
    }

    pub fn error(&self, reason: DocError) {
        self.finish(StreamOp::Error(reason.to_record()));
    }

    fn finish(&self, op: StreamOp) {
        {
            let mut state = self.state();
            if state.phase != SinkPhase::Open {
                return;
            }
            state.phase = SinkPhase::Closed;
            state.on_pull = None;
            state.on_cancel = None;
        }
        self.shared.readiness.send_replace(Readiness::Closed);

        if let Some(endpoint) = self.shared.endpoint.upgrade() {
            debug!(stream_id = self.shared.stream_id, op = op.name(), "finishing stream");
            endpoint.remove_sink(self.shared.stream_id);
            if let Err(e) = endpoint.post(MessageBody::Stream { stream_id: self.shared.stream_id, op }) {
                warn!(stream_id = self.shared.stream_id, error = %e, "could not post end of stream");
            }
        }
    }

    /// Called when the consumer pulls. The returned hook must run to completion before the pull
    ///  is acknowledged.
    pub fn set_on_pull<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DocError>> + Send + 'static,
    {
        self.state().on_pull = Some(Arc::new(move || hook().boxed()));
    }

    /// Called once when the consumer cancels the stream or the endpoint is torn down. The
    ///  cancel is acknowledged when the hook's future completes.
    pub fn set_on_cancel<F, Fut>(&self, hook: F)
    where
        F: FnOnce(DocError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DocError>> + Send + 'static,
    {
        self.state().on_cancel = Some(Box::new(move |reason| hook(reason).boxed()));
    }

    /// `None` if nothing needs to run before acknowledging the pull
    pub(crate) fn on_remote_pull(&self, desired_size: i64) -> Option<PullHook> {
        let mut state = self.state();
        if state.phase != SinkPhase::Open {
            return None;
        }

        if state.desired_size <= 0 && desired_size > 0 {
            self.shared.readiness.send_replace(Readiness::Ready);
        }
        state.desired_size = desired_size;
        state.on_pull.clone()
    }

    pub(crate) fn on_remote_cancel(&self, reason: DocError) -> Option<CancelHook> {
        let mut state = self.state();
        if state.phase != SinkPhase::Open {
            return None;
        }
        state.phase = SinkPhase::Cancelled;
        state.on_pull = None;
        self.shared.readiness.send_replace(Readiness::Cancelled(reason));
        state.on_cancel.take()
    }

    /// The start handler failed: the consumer learns about it through the start ack, so the sink
    ///  goes away silently.
    pub(crate) fn abandon(&self) {
        let mut state = self.state();
        state.phase = SinkPhase::Closed;
        state.on_pull = None;
        state.on_cancel = None;
        self.shared.readiness.send_replace(Readiness::Closed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use futures::FutureExt;
    use super::*;

    fn detached_sink(desired_size: i64) -> StreamSink {
        StreamSink::new(1, Weak::new(), desired_size)
    }

    #[tokio::test]
    async fn test_ready_follows_desired_size() {
        let sink = detached_sink(1);
        assert!(sink.ready().now_or_never().is_some());

        let hook = sink.on_remote_pull(0);
        assert!(hook.is_none());
        assert!(sink.ready().now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_blocked_until_pull() {
        let sink = detached_sink(0);
        assert!(sink.ready().now_or_never().is_none());

        let sink2 = sink.clone();
        let waiter = tokio::spawn(async move { sink2.ready().await });
        tokio::task::yield_now().await;

        sink.on_remote_pull(2);
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap(), Ok(()));
        assert_eq!(sink.desired_size(), 2);
    }

    #[tokio::test]
    async fn test_cancel_rejects_ready_and_runs_hook_once() {
        let sink = detached_sink(0);
        sink.set_on_cancel(|reason| async move {
            assert!(reason.is_abort());
            Ok(())
        });

        let hook = sink.on_remote_cancel(DocError::abort("stop"));
        assert!(hook.is_some());
        assert!(sink.on_remote_cancel(DocError::abort("again")).is_none());
        assert!(sink.is_cancelled());

        assert_eq!(sink.ready().await, Err(DocError::abort("stop")));
        assert!(sink.enqueue(Payload::empty(), 1).is_ok());
    }

    #[tokio::test]
    async fn test_pull_after_close_has_no_hook() {
        let sink = detached_sink(1);
        sink.set_on_pull(|| async { Ok(()) });
        sink.close();
        assert!(sink.on_remote_pull(5).is_none());
        assert!(sink.enqueue(Payload::empty(), 1).is_err());
        assert!(sink.ready().await.is_ok());
    }
}
