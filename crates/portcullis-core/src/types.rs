//! Common types used throughout Portcullis

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use std::net::SocketAddr;

/// Streaming body type used for both directions of the pipeline
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Build a body from a complete buffer
pub fn full(chunk: impl Into<Bytes>) -> Body {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Build an empty body
pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Correlation id of a plugin forward session.
///
/// Only the gateway may set this header; inbound copies are stripped.
pub const FORWARD_ID_HEADER: &str = "x-zr-forward-id";

/// Static capture path a request was routed through
pub const CAPTURE_HEADER: &str = "x-zr-capture";

/// Original request URI of a statically captured request
pub const CAPTURE_URI_HEADER: &str = "x-zr-uri";

/// Private escape header carrying an `Upgrade` value across the hop-by-hop strip
pub const ORIGIN_UPGRADE_HEADER: &str = "zr-origin-upgrade";

/// Headers that only the gateway is allowed to produce
pub const TRUSTED_HEADERS: [&str; 3] = [FORWARD_ID_HEADER, CAPTURE_HEADER, CAPTURE_URI_HEADER];

/// Connection facts attached to every inbound request as an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    /// Remote peer address
    pub remote_addr: SocketAddr,

    /// Whether the client connection is TLS-terminated in front of us
    pub tls: bool,
}

impl ConnInfo {
    /// Create connection info for a plain-text peer
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            tls: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_full_body_collects() {
        let body = full("hello");
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let bytes = empty().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_trusted_headers_are_lowercase() {
        for name in TRUSTED_HEADERS {
            assert_eq!(name, name.to_ascii_lowercase());
        }
    }
}
