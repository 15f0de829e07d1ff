use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::error::{DocError, ErrorRecord};
use crate::rpc::endpoint::EndpointInner;
use crate::rpc::message::{MessageBody, Payload, StreamOp};

/// Consumer side queueing strategy for a stream
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueHints {
    /// The consumer's desired size is `high_water_mark - sum of queued chunk sizes`. A value of
    ///  zero only suits producers that are driven by their `on_pull` hook.
    pub high_water_mark: i64,
}

impl Default for QueueHints {
    fn default() -> Self {
        QueueHints { high_water_mark: 1 }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamPhase {
    Starting,
    Active,
    Closed,
    Errored,
    Cancelling,
    Cancelled,
}

impl StreamPhase {
    fn is_terminal(&self) -> bool {
        matches!(self, StreamPhase::Closed | StreamPhase::Errored | StreamPhase::Cancelled)
    }
}

struct ConsumerState {
    phase: StreamPhase,
    error: Option<DocError>,
    queue: VecDeque<(Payload, i64)>,
    queued_size: i64,
    high_water_mark: i64,
    start_pending: bool,
    pull_in_flight: bool,
    waiting_reads: usize,
    cancel_ack: Option<oneshot::Sender<Result<(), DocError>>>,
}

impl ConsumerState {
    fn desired_size(&self) -> i64 {
        self.high_water_mark - self.queued_size
    }

    fn should_pull(&self) -> bool {
        self.phase == StreamPhase::Active
            && !self.pull_in_flight
            && (self.waiting_reads > 0 || self.desired_size() > 0)
    }

    fn can_be_removed(&self) -> bool {
        self.phase.is_terminal() && !self.start_pending && !self.pull_in_flight && self.cancel_ack.is_none()
    }

    fn set_errored(&mut self, reason: DocError) {
        self.phase = StreamPhase::Errored;
        self.error = Some(reason);
        self.queue.clear();
        self.queued_size = 0;
    }
}

/// Consumer side bookkeeping for one stream. The endpoint routes producer messages here, the
///  [StreamHandle] reads from it.
pub(crate) struct StreamController {
    stream_id: u64,
    state: Mutex<ConsumerState>,
    changed: Notify,
}

impl StreamController {
    pub(crate) fn new(stream_id: u64, hints: QueueHints) -> StreamController {
        StreamController {
            stream_id,
            state: Mutex::new(ConsumerState {
                phase: StreamPhase::Starting,
                error: None,
                queue: VecDeque::new(),
                queued_size: 0,
                high_water_mark: hints.high_water_mark,
                start_pending: true,
                pull_in_flight: false,
                waiting_reads: 0,
                cancel_ack: None,
            }),
            changed: Notify::new(),
        }
    }

    /// A stream that failed before it got off the ground (e.g. opened on a destroyed endpoint)
    pub(crate) fn new_errored(stream_id: u64, hints: QueueHints, reason: DocError) -> StreamController {
        let controller = StreamController::new(stream_id, hints);
        {
            let mut state = controller.state();
            state.start_pending = false;
            state.set_errored(reason);
        }
        controller
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn desired_size(&self) -> i64 {
        self.state().desired_size()
    }

    fn pull_if_needed(&self, endpoint: &EndpointInner) {
        let desired_size = {
            let mut state = self.state();
            if !state.should_pull() {
                return;
            }
            state.pull_in_flight = true;
            state.desired_size()
        };

        trace!(stream_id = self.stream_id, desired_size, "pull");
        if let Err(e) = endpoint.post(MessageBody::Stream { stream_id: self.stream_id, op: StreamOp::Pull { desired_size } }) {
            warn!(stream_id = self.stream_id, error = %e, "could not post pull");
            {
                let mut state = self.state();
                state.pull_in_flight = false;
                if !state.phase.is_terminal() {
                    state.set_errored(DocError::unknown("could not post pull", e.to_string()));
                }
            }
            self.changed.notify_waiters();
            self.remove_if_done(endpoint);
        }
    }

    fn remove_if_done(&self, endpoint: &EndpointInner) {
        if self.state().can_be_removed() {
            trace!(stream_id = self.stream_id, "removing stream controller");
            endpoint.remove_controller(self.stream_id);
        }
    }

    /// Handles a message from the producer. `Err` means the producer violated the protocol.
    pub(crate) fn on_message(&self, endpoint: &EndpointInner, op: StreamOp) -> anyhow::Result<()> {
        match op {
            StreamOp::StartAck(ack) => self.on_start_ack(ack),
            StreamOp::PullAck(ack) => self.on_pull_ack(ack),
            StreamOp::Enqueue { chunk, size } => self.on_enqueue(chunk, size)?,
            StreamOp::Close => self.on_close()?,
            StreamOp::Error(record) => self.on_error(record),
            StreamOp::CancelAck(ack) => self.on_cancel_ack(ack)?,
            other => bail!("stream {}: {} is not a message for the consumer", self.stream_id, other.name()),
        }

        self.changed.notify_waiters();
        self.pull_if_needed(endpoint);
        self.remove_if_done(endpoint);
        Ok(())
    }

    fn on_start_ack(&self, ack: Result<(), ErrorRecord>) {
        let mut state = self.state();
        state.start_pending = false;
        match ack {
            Ok(()) => {
                if state.phase == StreamPhase::Starting {
                    debug!(stream_id = self.stream_id, "stream started");
                    state.phase = StreamPhase::Active;
                }
            }
            Err(record) => {
                debug!(stream_id = self.stream_id, ?record, "stream failed to start");
                match state.phase {
                    StreamPhase::Starting | StreamPhase::Active => state.set_errored(DocError::from_record(record)),
                    StreamPhase::Cancelling => Self::cancel_overtaken(&mut state),
                    _ => {}
                }
            }
        }
    }

    fn on_pull_ack(&self, ack: Result<(), ErrorRecord>) {
        let mut state = self.state();
        state.pull_in_flight = false;
        if let Err(record) = ack {
            debug!(stream_id = self.stream_id, ?record, "pull failed");
            if matches!(state.phase, StreamPhase::Starting | StreamPhase::Active) {
                state.set_errored(DocError::from_record(record));
            }
        }
    }

    fn on_enqueue(&self, chunk: Payload, size: i64) -> anyhow::Result<()> {
        let mut state = self.state();
        match state.phase {
            StreamPhase::Starting | StreamPhase::Active => {
                state.queued_size += size;
                state.queue.push_back((chunk, size));
                Ok(())
            }
            StreamPhase::Cancelling | StreamPhase::Errored => {
                trace!(stream_id = self.stream_id, "dropping chunk for a stream that is going away");
                Ok(())
            }
            StreamPhase::Closed | StreamPhase::Cancelled => {
                bail!("stream {}: enqueue after the stream was {:?}", self.stream_id, state.phase)
            }
        }
    }

    fn on_close(&self) -> anyhow::Result<()> {
        let mut state = self.state();
        match state.phase {
            StreamPhase::Starting | StreamPhase::Active => {
                debug!(stream_id = self.stream_id, "stream closed by producer");
                state.phase = StreamPhase::Closed;
                Ok(())
            }
            StreamPhase::Cancelling => {
                Self::cancel_overtaken(&mut state);
                Ok(())
            }
            StreamPhase::Errored => Ok(()),
            StreamPhase::Closed | StreamPhase::Cancelled => {
                bail!("stream {}: close after the stream was {:?}", self.stream_id, state.phase)
            }
        }
    }

    fn on_error(&self, record: ErrorRecord) {
        let mut state = self.state();
        match state.phase {
            StreamPhase::Starting | StreamPhase::Active => {
                debug!(stream_id = self.stream_id, ?record, "stream errored by producer");
                state.set_errored(DocError::from_record(record));
            }
            StreamPhase::Cancelling => Self::cancel_overtaken(&mut state),
            _ => {}
        }
    }

    /// The producer finished the stream before it saw our cancel. It drops the cancel as being
    ///  for an unknown stream, so no ack is coming.
    fn cancel_overtaken(state: &mut ConsumerState) {
        state.phase = StreamPhase::Cancelled;
        if let Some(sender) = state.cancel_ack.take() {
            let _ = sender.send(Ok(()));
        }
    }

    fn on_cancel_ack(&self, ack: Result<(), ErrorRecord>) -> anyhow::Result<()> {
        let mut state = self.state();
        let Some(sender) = state.cancel_ack.take() else {
            if state.phase == StreamPhase::Cancelled {
                trace!(stream_id = self.stream_id, "late cancel ack - ignoring");
                return Ok(());
            }
            bail!("stream {}: cancel ack without a pending cancel", self.stream_id);
        };
        state.phase = StreamPhase::Cancelled;
        let _ = sender.send(ack.map_err(DocError::from_record));
        Ok(())
    }

    /// Endpoint teardown: everything pending settles with `reason`.
    pub(crate) fn settle(&self, reason: DocError) {
        {
            let mut state = self.state();
            state.start_pending = false;
            state.pull_in_flight = false;
            match state.phase {
                StreamPhase::Starting | StreamPhase::Active => state.set_errored(reason.clone()),
                StreamPhase::Cancelling => {
                    state.phase = StreamPhase::Cancelled;
                    if let Some(sender) = state.cancel_ack.take() {
                        let _ = sender.send(Err(reason));
                    }
                }
                _ => {}
            }
        }
        self.changed.notify_waiters();
    }
}

/// The consumer's handle for a stream opened with
///  [crate::rpc::endpoint::RpcEndpoint::open_stream].
pub struct StreamHandle {
    controller: Arc<StreamController>,
    endpoint: Arc<EndpointInner>,
}

impl Debug for StreamHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamHandle{{id:{}, phase:{:?}}}", self.controller.stream_id, self.phase())
    }
}

/// Registers a waiting read for the pull rule for as long as it is alive.
struct WaitingRead<'a>(&'a StreamController);

impl <'a> WaitingRead<'a> {
    fn new(controller: &'a StreamController) -> WaitingRead<'a> {
        controller.state().waiting_reads += 1;
        WaitingRead(controller)
    }
}

impl Drop for WaitingRead<'_> {
    fn drop(&mut self) {
        self.0.state().waiting_reads -= 1;
    }
}

impl StreamHandle {
    pub(crate) fn new(controller: Arc<StreamController>, endpoint: Arc<EndpointInner>) -> StreamHandle {
        StreamHandle { controller, endpoint }
    }

    pub fn stream_id(&self) -> u64 {
        self.controller.stream_id
    }

    pub fn phase(&self) -> StreamPhase {
        self.controller.state().phase
    }

    pub fn desired_size(&self) -> i64 {
        self.controller.desired_size()
    }

    /// The next chunk, `Ok(None)` once the stream was closed by the producer or cancelled
    ///  locally, or the stream's error.
    pub async fn read(&self) -> Result<Option<Payload>, DocError> {
        loop {
            let notified = self.controller.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.controller.state();
                if let Some((chunk, size)) = state.queue.pop_front() {
                    state.queued_size -= size;
                    drop(state);
                    self.controller.pull_if_needed(&self.endpoint);
                    return Ok(Some(chunk));
                }
                match state.phase {
                    StreamPhase::Errored => {
                        return Err(state.error.clone()
                            .unwrap_or_else(|| DocError::unknown("stream errored", "no reason recorded")));
                    }
                    StreamPhase::Closed | StreamPhase::Cancelling | StreamPhase::Cancelled => return Ok(None),
                    StreamPhase::Starting | StreamPhase::Active => {}
                }
            }

            let _waiting = WaitingRead::new(&self.controller);
            self.controller.pull_if_needed(&self.endpoint);
            notified.await;
        }
    }

    /// Alias for [StreamHandle::read]
    pub async fn pull(&self) -> Result<Option<Payload>, DocError> {
        self.read().await
    }

    /// Asks the producer to stop and waits for its acknowledgement. Pending and future reads
    ///  return end of stream right away. Cancelling a stream that already ended is a no-op.
    pub async fn cancel(&self, reason: DocError) -> Result<(), DocError> {
        let receiver = {
            let mut state = self.controller.state();
            if !matches!(state.phase, StreamPhase::Starting | StreamPhase::Active) {
                return Ok(());
            }
            state.phase = StreamPhase::Cancelling;
            state.queue.clear();
            state.queued_size = 0;
            let (sender, receiver) = oneshot::channel();
            state.cancel_ack = Some(sender);
            receiver
        };
        self.controller.changed.notify_waiters();

        debug!(stream_id = self.controller.stream_id, %reason, "cancelling stream");
        let op = StreamOp::Cancel(reason.to_record());
        if let Err(e) = self.endpoint.post(MessageBody::Stream { stream_id: self.controller.stream_id, op }) {
            warn!(stream_id = self.controller.stream_id, error = %e, "could not post cancel");
            self.controller.settle(DocError::unknown("could not post cancel", e.to_string()));
            self.controller.remove_if_done(&self.endpoint);
        }

        receiver.await
            .unwrap_or_else(|_| Err(DocError::abort("stream controller went away")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use bytes::Bytes;
    use futures::FutureExt;
    use serde_json::json;
    use crate::rpc::sink::StreamSink;
    use crate::test_util::loopback_endpoints;
    use super::*;

    fn chunk(i: u8) -> Payload {
        Payload::binary(Bytes::from(vec![i; 4]))
    }

    #[tokio::test]
    async fn test_overfilled_queue_is_delivered() {
        let (main, worker) = loopback_endpoints();
        worker.on_stream("Eager", |_, sink: StreamSink| async move {
            for i in 0..3 {
                sink.enqueue(chunk(i), 1).unwrap();
            }
            assert_eq!(sink.desired_size(), -2);
            assert!(sink.ready().now_or_never().is_none());
            sink.close();
            Ok(())
        }).unwrap();

        let stream = main.open_stream("Eager", Payload::empty(), Some(QueueHints { high_water_mark: 1 }));
        for i in 0..3 {
            assert_eq!(stream.read().await, Ok(Some(chunk(i))));
        }
        assert_eq!(stream.read().await, Ok(None));
    }

    #[tokio::test]
    async fn test_chunks_then_end() {
        let (main, worker) = loopback_endpoints();
        worker.on_stream("Numbers", |data: Payload, sink: StreamSink| async move {
            let n = data.value["n"].as_u64().unwrap_or(0);
            tokio::spawn(async move {
                for i in 0..n {
                    if sink.ready().await.is_err() {
                        return;
                    }
                    sink.enqueue(chunk(i as u8), 1).unwrap();
                }
                sink.close();
            });
            Ok(())
        }).unwrap();

        let stream = main.open_stream("Numbers", Payload::value(json!({"n": 5})), None);
        for i in 0..5 {
            assert_eq!(stream.read().await, Ok(Some(chunk(i))));
        }
        assert_eq!(stream.read().await, Ok(None));
        assert_eq!(stream.phase(), StreamPhase::Closed);
        assert_eq!(stream.read().await, Ok(None));
    }

    #[tokio::test]
    async fn test_backpressure_blocks_producer_until_pull() {
        let (main, worker) = loopback_endpoints();
        let (sink_sender, sink_receiver) = oneshot::channel::<StreamSink>();
        let sink_sender = Mutex::new(Some(sink_sender));

        worker.on_stream("Three", move |_, sink: StreamSink| {
            let sender = sink_sender.lock().unwrap().take();
            async move {
                assert_eq!(sink.desired_size(), 1);
                sink.enqueue(chunk(0), 1).unwrap();
                if let Some(sender) = sender {
                    let _ = sender.send(sink);
                }
                Ok(())
            }
        }).unwrap();

        let stream = main.open_stream("Three", Payload::empty(), Some(QueueHints { high_water_mark: 1 }));
        let sink = sink_receiver.await.unwrap();

        // the consumer's queue is full, so it does not pull until something is read
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.desired_size(), 0);
        assert!(sink.ready().now_or_never().is_none());

        assert_eq!(stream.read().await, Ok(Some(chunk(0))));
        tokio::time::timeout(Duration::from_secs(1), sink.ready()).await.unwrap().unwrap();
        assert_eq!(sink.desired_size(), 1);

        sink.enqueue(chunk(1), 1).unwrap();
        sink.enqueue(chunk(2), 1).unwrap();
        assert_eq!(sink.desired_size(), -1);
        sink.close();

        assert_eq!(stream.read().await, Ok(Some(chunk(1))));
        assert_eq!(stream.read().await, Ok(Some(chunk(2))));
        assert_eq!(stream.read().await, Ok(None));
    }

    #[tokio::test]
    async fn test_on_pull_drives_producer() {
        let (main, worker) = loopback_endpoints();
        let pulls = Arc::new(AtomicUsize::new(0));

        let pulls2 = pulls.clone();
        worker.on_stream("Pulled", move |_, sink: StreamSink| {
            let pulls = pulls2.clone();
            let sink2 = sink.clone();
            sink.set_on_pull(move || {
                let sink = sink2.clone();
                let n = pulls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        sink.enqueue(chunk(n as u8), 1).map_err(|e| DocError::unknown("enqueue", e.to_string()))?;
                    }
                    else {
                        sink.close();
                    }
                    Ok(())
                }
            });
            async { Ok(()) }
        }).unwrap();

        let stream = main.open_stream("Pulled", Payload::empty(), None);
        let mut received = Vec::new();
        while let Some(c) = stream.read().await.unwrap() {
            received.push(c);
        }
        assert_eq!(received, vec![chunk(0), chunk(1), chunk(2)]);
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_start_failure_errors_stream() {
        let (main, worker) = loopback_endpoints();
        worker.on_stream("Broken", |_, _sink: StreamSink| async {
            Err(DocError::MissingResource { message: "no such file".to_string() })
        }).unwrap();

        let stream = main.open_stream("Broken", Payload::empty(), None);
        assert_eq!(stream.read().await, Err(DocError::MissingResource { message: "no such file".to_string() }));
        assert_eq!(stream.phase(), StreamPhase::Errored);
    }

    #[tokio::test]
    async fn test_producer_error() {
        let (main, worker) = loopback_endpoints();
        worker.on_stream("Fails", |_, sink: StreamSink| async move {
            sink.enqueue(chunk(1), 1).unwrap();
            sink.error(DocError::invalid_document("bad xref"));
            Ok(())
        }).unwrap();

        let stream = main.open_stream("Fails", Payload::empty(), Some(QueueHints { high_water_mark: 10 }));
        // the queue is discarded when the stream errors
        let result = loop {
            match stream.read().await {
                Ok(Some(_)) => continue,
                other => break other,
            }
        };
        assert_eq!(result, Err(DocError::invalid_document("bad xref")));
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_read_and_runs_hook() {
        let (main, worker) = loopback_endpoints();
        let (cancel_sender, cancel_receiver) = oneshot::channel::<DocError>();
        let cancel_sender = Mutex::new(Some(cancel_sender));

        worker.on_stream("Never", move |_, sink: StreamSink| {
            let sender = cancel_sender.lock().unwrap().take();
            sink.set_on_cancel(move |reason| async move {
                if let Some(sender) = sender {
                    let _ = sender.send(reason);
                }
                Ok(())
            });
            async { Ok(()) }
        }).unwrap();

        let stream = Arc::new(main.open_stream("Never", Payload::empty(), None));
        let stream2 = stream.clone();
        let reader = tokio::spawn(async move { stream2.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(stream.cancel(DocError::abort("user")).await, Ok(()));
        assert_eq!(tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap(), Ok(None));
        assert_eq!(cancel_receiver.await.unwrap(), DocError::abort("user"));
        assert_eq!(stream.phase(), StreamPhase::Cancelled);

        // cancelling again is a no-op
        assert_eq!(stream.cancel(DocError::abort("again")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_cancel_hook_failure_is_reported() {
        let (main, worker) = loopback_endpoints();
        worker.on_stream("Stubborn", |_, sink: StreamSink| {
            sink.set_on_cancel(|_| async { Err(DocError::unknown("cannot stop", "busy")) });
            async { Ok(()) }
        }).unwrap();

        let stream = main.open_stream("Stubborn", Payload::empty(), None);
        let result = stream.cancel(DocError::abort("user")).await;
        assert_eq!(result, Err(DocError::unknown("cannot stop", "busy")));
    }
}
