//! httpreplay
//!
//! Replays captured raw HTTP/1.x requests against a fixed destination and
//! reads back the destination's response.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod response;
pub mod rewrite;
pub mod trace;
mod transport;

pub use client::{Exchange, ReplayClient};
pub use config::ClientConfig;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use response::InboundMessage;
pub use trace::{Direction, LogSink, MemorySink, TraceEvent, TraceSink};
