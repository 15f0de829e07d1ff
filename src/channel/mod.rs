pub mod framed;
pub mod loopback;

use std::sync::Arc;

use crate::rpc::message::Message;

/// A bidirectional, order preserving message transport between two execution contexts.
///
/// Implementations deliver messages in send order. They do not interpret messages - filtering by
///  source / target and all protocol semantics live in [crate::rpc::endpoint::RpcEndpoint].
#[async_trait::async_trait]
pub trait Channel: Sync + Send {
    /// Hands a message to the channel for delivery. This never blocks and never calls back into
    ///  the caller, so it is safe to call while holding a lock.
    fn post_message(&self, message: Message) -> anyhow::Result<()>;

    /// Feeds received messages to `handler` one at a time until the loop is cancelled
    ///  (`Ok(())`), the peer goes away, or the handler reports a protocol violation (both `Err`).
    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);

    /// true if binary payloads are handed over without copying
    fn supports_transfer(&self) -> bool;
}

/// Decouples message transport from the handling of a message once it is received.
///
/// An `Err` is fatal for the channel: the receive loop terminates with it.
#[async_trait::async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle_message(&self, message: Message) -> anyhow::Result<()>;
}
