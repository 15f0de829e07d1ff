use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, MessageHandler};
use crate::config::EndpointConfig;
use crate::error::DocError;
use crate::rpc::message::{Message, MessageBody, Payload, StreamOp};
use crate::rpc::sink::StreamSink;
use crate::rpc::stream::{QueueHints, StreamController, StreamHandle};

type CallHandler = Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<Payload, DocError>> + Send + Sync>;
type StreamHandler = Arc<dyn Fn(Payload, StreamSink) -> BoxFuture<'static, Result<(), DocError>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Call(CallHandler),
    Stream(StreamHandler),
}

struct EndpointState {
    next_call_id: u64,
    next_stream_id: u64,
    handlers: FxHashMap<String, Handler>,
    pending_calls: FxHashMap<u64, oneshot::Sender<Result<Payload, DocError>>>,
    stream_controllers: FxHashMap<u64, Arc<StreamController>>,
    stream_sinks: FxHashMap<u64, StreamSink>,
    /// set once on teardown - everything pending was settled with this
    teardown_reason: Option<DocError>,
}

pub(crate) struct EndpointInner {
    config: EndpointConfig,
    channel: Arc<dyn Channel>,
    detached: AtomicBool,
    state: Mutex<EndpointState>,
}

/// One side of the RPC protocol on top of a [Channel]: fire-and-forget actions, calls correlated
///  by id, and streams with pull based backpressure. Both sides of a channel have an endpoint,
///  and either side can be caller and callee.
///
/// Handlers are invoked in message order, each of them up to the point where it returns its
///  future. The futures run as separate tasks, so a slow handler does not hold up the channel.
#[derive(Clone)]
pub struct RpcEndpoint {
    inner: Arc<EndpointInner>,
}

impl Debug for RpcEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcEndpoint{{{}->{}}}", self.inner.config.source_name, self.inner.config.target_name)
    }
}

impl RpcEndpoint {
    /// Creates the endpoint and starts receiving on `channel`. This spawns the receive loop, so
    ///  it must be called from inside a tokio runtime.
    pub fn new(config: EndpointConfig, channel: Arc<dyn Channel>) -> anyhow::Result<RpcEndpoint> {
        config.validate()?;

        let inner = Arc::new(EndpointInner {
            config,
            channel,
            detached: AtomicBool::new(false),
            state: Mutex::new(EndpointState {
                next_call_id: 1,
                next_stream_id: 1,
                handlers: Default::default(),
                pending_calls: Default::default(),
                stream_controllers: Default::default(),
                stream_sinks: Default::default(),
                teardown_reason: None,
            }),
        });

        let channel = inner.channel.clone();
        let source_name = inner.config.source_name.clone();
        let handler = Arc::new(ReceivedMessageHandler { endpoint: Arc::downgrade(&inner) });
        tokio::spawn(run_recv_loop(source_name, channel, handler));

        Ok(RpcEndpoint { inner })
    }

    pub fn source_name(&self) -> &str {
        &self.inner.config.source_name
    }

    /// true if the underlying channel hands over binary payloads without copying
    pub fn supports_transfer(&self) -> bool {
        self.inner.channel.supports_transfer()
    }

    /// Registers the handler for calls and fire-and-forget actions named `action`. There can be
    ///  only one handler per action name - registering a second one is an error.
    pub fn on<F, Fut>(&self, action: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, DocError>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |data| handler(data).boxed());
        self.register(action, Handler::Call(handler))
    }

    /// Registers the producer for streams named `action`. The handler is invoked once per stream
    ///  when the consumer opens it; its future completing (or failing) is the stream's start
    ///  acknowledgement. Long running production belongs in a spawned task or the sink's pull hook.
    pub fn on_stream<F, Fut>(&self, action: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Payload, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DocError>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |data, sink| handler(data, sink).boxed());
        self.register(action, Handler::Stream(handler))
    }

    fn register(&self, action: &str, handler: Handler) -> anyhow::Result<()> {
        match self.inner.state().handlers.entry(action.to_string()) {
            Entry::Occupied(_) => {
                Err(anyhow!("there is already a handler for action {:?}", action))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    /// Fire-and-forget: the only failure the sender sees is the channel refusing the message.
    pub fn send(&self, action: &str, data: Payload) -> anyhow::Result<()> {
        if let Some(reason) = self.inner.state().teardown_reason.clone() {
            bail!("endpoint is torn down: {}", reason);
        }
        trace!(action, "sending action");
        self.inner.post(MessageBody::Action { action: action.to_string(), data })
    }

    /// Calls `action` on the other side and waits for its response.
    ///
    /// If the channel refuses the message, this fails right away without leaving anything
    ///  pending. Endpoint teardown settles the call with the teardown reason.
    pub async fn call(&self, action: &str, data: Payload) -> Result<Payload, DocError> {
        let receiver = {
            let mut state = self.inner.state();
            if let Some(reason) = &state.teardown_reason {
                return Err(reason.clone());
            }

            let call_id = state.next_call_id;
            state.next_call_id += 1;

            // NB: posting while holding the lock so a fast response can not overtake the registration
            trace!(action, call_id, "calling");
            if let Err(e) = self.inner.post(MessageBody::Call { action: action.to_string(), call_id, data }) {
                debug!(action, call_id, error = %e, "channel refused call");
                return Err(DocError::unknown(format!("could not send call {:?}", action), e.to_string()));
            }

            let (sender, receiver) = oneshot::channel();
            state.pending_calls.insert(call_id, sender);
            receiver
        };

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(DocError::abort("endpoint dropped the pending call")),
        }
    }

    /// Opens a stream served by the other side's [RpcEndpoint::on_stream] handler for `action`.
    ///  `hints` default to the endpoint's configured high water mark.
    pub fn open_stream(&self, action: &str, data: Payload, hints: Option<QueueHints>) -> StreamHandle {
        let hints = hints.unwrap_or(QueueHints { high_water_mark: self.inner.config.default_high_water_mark });

        let mut state = self.inner.state();
        let stream_id = state.next_stream_id;
        state.next_stream_id += 1;

        if let Some(reason) = &state.teardown_reason {
            let controller = Arc::new(StreamController::new_errored(stream_id, hints, reason.clone()));
            return StreamHandle::new(controller, self.inner.clone());
        }

        debug!(action, stream_id, high_water_mark = hints.high_water_mark, "opening stream");
        let op = StreamOp::Start { action: action.to_string(), data, desired_size: hints.high_water_mark };
        let controller = match self.inner.post(MessageBody::Stream { stream_id, op }) {
            Ok(()) => {
                let controller = Arc::new(StreamController::new(stream_id, hints));
                state.stream_controllers.insert(stream_id, controller.clone());
                controller
            }
            Err(e) => {
                debug!(action, stream_id, error = %e, "channel refused stream start");
                let reason = DocError::unknown(format!("could not open stream {:?}", action), e.to_string());
                Arc::new(StreamController::new_errored(stream_id, hints, reason))
            }
        };
        StreamHandle::new(controller, self.inner.clone())
    }

    /// Detaches from the channel and settles every pending call and stream, consumer and
    ///  producer side, with an [DocError::Abort]. Calling this more than once has no
    ///  further effect.
    pub fn destroy(&self) {
        info!(endpoint = %self.inner.config.source_name, "destroying endpoint");
        self.inner.detached.store(true, Ordering::SeqCst);
        self.inner.channel.cancel_recv_loop();
        self.inner.settle_all(DocError::abort("endpoint destroyed"));
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state().teardown_reason.is_some()
    }

    /// The reason everything pending was settled with, if the endpoint was torn down - either
    ///  by [RpcEndpoint::destroy] or because the receive loop ended.
    pub fn teardown_reason(&self) -> Option<DocError> {
        self.inner.state().teardown_reason.clone()
    }

    pub fn pending_call_count(&self) -> usize {
        self.inner.state().pending_calls.len()
    }

    pub fn open_stream_count(&self) -> usize {
        self.inner.state().stream_controllers.len()
    }

    pub fn open_sink_count(&self) -> usize {
        self.inner.state().stream_sinks.len()
    }
}

#[tracing::instrument(skip(channel, handler))]
async fn run_recv_loop(endpoint: String, channel: Arc<dyn Channel>, handler: Arc<ReceivedMessageHandler>) {
    let weak = handler.endpoint.clone();
    let result = channel.recv_loop(handler).await;

    let Some(inner) = weak.upgrade() else {
        debug!("receive loop ended after the endpoint was dropped");
        return;
    };
    match result {
        Ok(()) => {
            info!("receive loop shut down");
            inner.settle_all(DocError::abort("endpoint destroyed"));
        }
        Err(e) => {
            error!(error = %e, "receive loop terminated");
            inner.detached.store(true, Ordering::SeqCst);
            inner.settle_all(DocError::unknown("channel closed", e.to_string()));
        }
    }
}

impl EndpointInner {
    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn post(&self, body: MessageBody) -> anyhow::Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            bail!("endpoint {} is detached from its channel", self.config.source_name);
        }
        self.channel.post_message(Message {
            source: self.config.source_name.clone(),
            target: self.config.target_name.clone(),
            body,
        })
    }

    fn post_or_log(&self, body: MessageBody) {
        if let Err(e) = self.post(body) {
            debug!(error = %e, "could not post reply");
        }
    }

    pub(crate) fn remove_controller(&self, stream_id: u64) {
        self.state().stream_controllers.remove(&stream_id);
    }

    pub(crate) fn remove_sink(&self, stream_id: u64) {
        self.state().stream_sinks.remove(&stream_id);
    }

    fn settle_all(&self, reason: DocError) {
        let (calls, controllers, sinks) = {
            let mut state = self.state();
            if state.teardown_reason.is_some() {
                return;
            }
            state.teardown_reason = Some(reason.clone());
            (
                std::mem::take(&mut state.pending_calls),
                std::mem::take(&mut state.stream_controllers),
                std::mem::take(&mut state.stream_sinks),
            )
        };

        debug!(calls = calls.len(), streams = controllers.len(), sinks = sinks.len(), %reason, "settling everything pending");

        for (_, sender) in calls {
            let _ = sender.send(Err(reason.clone()));
        }
        for (_, controller) in controllers {
            controller.settle(reason.clone());
        }
        for (stream_id, sink) in sinks {
            if let Some(hook) = sink.on_remote_cancel(reason.clone()) {
                let reason = reason.clone();
                tokio::spawn(async move {
                    if let Err(e) = hook(reason).await {
                        debug!(stream_id, error = %e, "cancel hook failed during teardown");
                    }
                });
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: Message) -> anyhow::Result<()> {
        if message.target != self.config.source_name {
            trace!(target = message.target, "message for a different endpoint - ignoring");
            return Ok(());
        }
        if self.state().teardown_reason.is_some() {
            trace!("endpoint is torn down - ignoring message");
            return Ok(());
        }

        match message.body {
            MessageBody::Action { action, data } => self.on_action(action, None, data),
            MessageBody::Call { action, call_id, data } => self.on_action(action, Some(call_id), data),
            MessageBody::Response { call_id, outcome } => {
                let Some(sender) = self.state().pending_calls.remove(&call_id) else {
                    bail!("response for unknown call id {}", call_id);
                };
                trace!(call_id, ok = outcome.is_ok(), "response");
                let _ = sender.send(outcome.map_err(DocError::from_record));
                Ok(())
            }
            MessageBody::Stream { stream_id, op } if op.is_for_consumer() => self.on_consumer_message(stream_id, op),
            MessageBody::Stream { stream_id, op } => self.on_producer_message(stream_id, op),
        }
    }

    fn handler(&self, action: &str) -> anyhow::Result<Handler> {
        self.state().handlers.get(action)
            .cloned()
            .ok_or_else(|| anyhow!("no handler for action {:?}", action))
    }

    fn on_action(self: &Arc<Self>, action: String, call_id: Option<u64>, data: Payload) -> anyhow::Result<()> {
        let Handler::Call(handler) = self.handler(&action)? else {
            bail!("action {:?} is a stream action", action);
        };

        trace!(action, ?call_id, "invoking handler");
        let fut = handler(data);
        match call_id {
            None => {
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        warn!(action, error = %e, "action handler failed");
                    }
                });
            }
            Some(call_id) => {
                let endpoint = self.clone();
                tokio::spawn(async move {
                    let outcome = fut.await.map_err(|e| e.to_record());
                    endpoint.post_or_log(MessageBody::Response { call_id, outcome });
                });
            }
        }
        Ok(())
    }

    fn on_consumer_message(&self, stream_id: u64, op: StreamOp) -> anyhow::Result<()> {
        let controller = self.state().stream_controllers.get(&stream_id).cloned();
        match controller {
            Some(controller) => controller.on_message(self, op),
            None => match op {
                StreamOp::StartAck(_) | StreamOp::PullAck(_) | StreamOp::CancelAck(_) => {
                    debug!(stream_id, op = op.name(), "ack for a stream that is gone - ignoring");
                    Ok(())
                }
                _ => bail!("{} for unknown stream {}", op.name(), stream_id),
            }
        }
    }

    fn on_producer_message(self: &Arc<Self>, stream_id: u64, op: StreamOp) -> anyhow::Result<()> {
        match op {
            StreamOp::Start { action, data, desired_size } => {
                let Handler::Stream(handler) = self.handler(&action)? else {
                    bail!("action {:?} is not a stream action", action);
                };

                let sink = StreamSink::new(stream_id, Arc::downgrade(self), desired_size);
                match self.state().stream_sinks.entry(stream_id) {
                    Entry::Occupied(_) => bail!("stream id {} is already in use", stream_id),
                    Entry::Vacant(e) => { e.insert(sink.clone()); }
                }

                debug!(action, stream_id, desired_size, "starting stream");
                let fut = handler(data, sink.clone());
                let endpoint = self.clone();
                tokio::spawn(async move {
                    let result = fut.await;
                    if let Err(e) = &result {
                        debug!(stream_id, error = %e, "stream handler failed");
                        sink.abandon();
                        endpoint.remove_sink(stream_id);
                    }
                    let ack = result.map_err(|e| e.to_record());
                    endpoint.post_or_log(MessageBody::Stream { stream_id, op: StreamOp::StartAck(ack) });
                });
                Ok(())
            }
            StreamOp::Pull { desired_size } => {
                let sink = self.state().stream_sinks.get(&stream_id).cloned();
                let hook = sink.and_then(|s| s.on_remote_pull(desired_size));
                match hook {
                    None => {
                        // NB: this includes pulls that arrive after the sink was closed
                        self.post_or_log(MessageBody::Stream { stream_id, op: StreamOp::PullAck(Ok(())) });
                    }
                    Some(hook) => {
                        let endpoint = self.clone();
                        tokio::spawn(async move {
                            let ack = hook().await.map_err(|e| e.to_record());
                            endpoint.post_or_log(MessageBody::Stream { stream_id, op: StreamOp::PullAck(ack) });
                        });
                    }
                }
                Ok(())
            }
            StreamOp::Cancel(record) => {
                let Some(sink) = self.state().stream_sinks.remove(&stream_id) else {
                    debug!(stream_id, "cancel for unknown stream - ignoring");
                    return Ok(());
                };
                let reason = DocError::from_record(record);
                debug!(stream_id, %reason, "stream cancelled by consumer");

                let hook = sink.on_remote_cancel(reason.clone());
                let endpoint = self.clone();
                tokio::spawn(async move {
                    let ack = match hook {
                        Some(hook) => hook(reason).await.map_err(|e| e.to_record()),
                        None => Ok(()),
                    };
                    endpoint.post_or_log(MessageBody::Stream { stream_id, op: StreamOp::CancelAck(ack) });
                });
                Ok(())
            }
            other => bail!("stream {}: {} is not a message for the producer", stream_id, other.name()),
        }
    }
}

struct ReceivedMessageHandler {
    endpoint: Weak<EndpointInner>,
}

#[async_trait]
impl MessageHandler for ReceivedMessageHandler {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
        let Some(endpoint) = self.endpoint.upgrade() else {
            bail!("endpoint was dropped");
        };
        endpoint.dispatch(message)
    }
}
