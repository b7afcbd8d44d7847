//! # Portcullis Proxy
//!
//! Reverse-proxy forwarding toward a single upstream:
//! - Director rewriting scheme, authority, path and query
//! - Hop-by-hop stripping and `X-Forwarded-*` handling
//! - Streaming responses with configurable flush latency and trailers
//! - CONNECT tunnels over upgraded connections with an absolute deadline
//!
//! Errors are returned classified (`UpstreamConnection`, `UpstreamTimeout`,
//! `HijackUnsupported`, `Tunnel`); the caller decides what to write to the client.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod client;
pub mod director;
pub mod engine;
pub mod flush;
pub mod headers;
pub mod tunnel;

pub use client::HttpClient;
pub use director::{join_query, join_url_path, Director};
pub use engine::{ForwardOptions, ForwardingEngine};
pub use flush::{FlushInterval, FlushWriter};
pub use headers::HeaderRule;
pub use tunnel::{relay, TunnelEnd, DEFAULT_TUNNEL_TIMEOUT};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::HttpClient;
    pub use crate::engine::{ForwardOptions, ForwardingEngine};
    pub use crate::flush::FlushInterval;
    pub use crate::headers::HeaderRule;
}
