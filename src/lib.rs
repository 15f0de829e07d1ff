//! Moving documents between an application's main context and an isolated parsing context.
//!
//! * [rpc] - calls, fire-and-forget actions and pull based streams over a [channel::Channel]
//! * [source] - byte sources for local files, http origins, host clients and pushed data
//! * [transport] - the document protocol: the main side's [transport::document::DocumentTransport]
//!   and the parsing side's [transport::remote::RemoteHost]
//! * [render] - cooperative, cancellable execution of operator lists

pub mod channel;
pub mod config;
pub mod error;
pub mod render;
pub mod rpc;
pub mod source;
pub mod test_util;
pub mod transport;
pub mod util;
