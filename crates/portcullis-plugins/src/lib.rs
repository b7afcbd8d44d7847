//! # Portcullis Plugins
//!
//! Plugin routing on both sides of the loopback connection:
//! - [`SniffSnapshot`], the request projection a plugin is asked about
//! - [`SniffRouter`], the gateway stage offering requests to plugins
//! - [`PathRouter`], the router a plugin embeds to answer the gateway
//!
//! Plugins are separate processes reached over HTTP on `127.0.0.1`. Their
//! lifecycle is managed elsewhere; this crate only routes.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod path_router;
pub mod router;
pub mod snapshot;

pub use path_router::{handler_fn, Handler, PathRouter, RequestHandler, SniffHandler};
pub use router::{normalize_path, PluginSpec, RouteOutcome, SniffResult, SniffRouter, StaticCapture};
pub use snapshot::SniffSnapshot;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::path_router::{handler_fn, PathRouter};
    pub use crate::router::{PluginSpec, RouteOutcome, SniffResult, SniffRouter};
    pub use crate::snapshot::SniffSnapshot;
}
