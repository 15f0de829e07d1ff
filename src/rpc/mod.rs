//! The RPC protocol between the main side and the remote side.
//!
//! An [endpoint::RpcEndpoint] turns a [crate::channel::Channel] into three kinds of interaction:
//!  * fire-and-forget actions ([endpoint::RpcEndpoint::send])
//!  * calls that are correlated with their response by a call id ([endpoint::RpcEndpoint::call])
//!  * streams with pull based backpressure ([endpoint::RpcEndpoint::open_stream] on the consumer
//!    side, [sink::StreamSink] on the producer side)
//!
//! Streams follow this exchange, with ids allocated by the consumer:
//!
//! ```ascii
//! consumer                      producer
//!    start(desired size)  --->  handler(data, sink) invoked once
//!                         <---  startAck
//!    pull(desired size)   --->  on_pull hook
//!                         <---  enqueue* (each decrements the sink's desired size)
//!                         <---  pullAck
//!                         <---  close | error
//!    cancel(reason)       --->  on_cancel hook
//!                         <---  cancelAck
//! ```

pub mod endpoint;
pub mod message;
pub mod sink;
pub mod stream;
pub mod wire;
