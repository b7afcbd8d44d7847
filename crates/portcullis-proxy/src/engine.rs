//! Forwarding engine: one upstream, many requests
//!
//! Plain requests go through the director, header normalization and the
//! pooled client, and the upstream response is streamed back with the
//! configured flush behavior. CONNECT requests are tunneled: the target is
//! dialed, the client receives `200`, and once hyper hands over the upgraded
//! connection the bytes are pumped both ways until the absolute deadline.

use crate::client::HttpClient;
use crate::director::Director;
use crate::flush::{stream_body, ExitHook, FlushInterval, StreamHints};
use crate::headers::{
    add_forwarded_for, announce_trailers, declared_trailers, inject_user_headers,
    remove_hop_headers, rewrite_user_agent, HeaderRule,
};
use crate::tunnel::{relay, DEFAULT_TUNNEL_TIMEOUT};
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Version};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use portcullis_core::{empty, Body, ConnInfo, Error, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Per-upstream forwarding options
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Flush behavior when nothing about the request asks for streaming
    pub flush_interval: FlushInterval,

    /// Lifetime of a CONNECT tunnel
    pub tunnel_timeout: Duration,

    /// Force `Cache-Control: no-store` on both legs
    pub no_cache: bool,

    /// Header rules applied to the upstream request
    pub upstream_headers: Vec<HeaderRule>,

    /// Header rules applied to the client response
    pub downstream_headers: Vec<HeaderRule>,

    /// Keep the client's Host header instead of the target authority
    pub preserve_host: bool,

    /// Host header sent upstream, wins over `preserve_host`
    pub host_override: Option<String>,

    /// User agent sent when the client did not provide one
    pub user_agent: Option<HeaderValue>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            flush_interval: FlushInterval::Disabled,
            tunnel_timeout: DEFAULT_TUNNEL_TIMEOUT,
            no_cache: false,
            upstream_headers: Vec::new(),
            downstream_headers: Vec::new(),
            preserve_host: false,
            host_override: None,
            user_agent: Some(HeaderValue::from_static(concat!(
                "portcullis/",
                env!("CARGO_PKG_VERSION")
            ))),
        }
    }
}

/// Reverse proxy toward a single target
#[derive(Debug, Clone)]
pub struct ForwardingEngine {
    director: Director,
    client: HttpClient,
    options: ForwardOptions,
}

impl ForwardingEngine {
    /// Create an engine for `target`
    pub fn new(target: &str, client: HttpClient, options: ForwardOptions) -> Result<Self> {
        Ok(Self {
            director: Director::parse(target)?,
            client,
            options,
        })
    }

    /// The director in use
    pub fn director(&self) -> &Director {
        &self.director
    }

    /// Options in use
    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Forward `req`, tunneling CONNECT requests
    pub async fn serve(&self, req: Request<Body>) -> Result<Response<Body>> {
        if req.method() == Method::CONNECT {
            self.serve_connect(req).await
        } else {
            self.serve_http(req).await
        }
    }

    /// Round-trip a request to the upstream and stream the response back
    pub async fn serve_http(&self, req: Request<Body>) -> Result<Response<Body>> {
        let conn = req.extensions().get::<ConnInfo>().copied();
        let hints = StreamHints::from_request(&req);
        let (mut parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        self.director.direct(&mut parts)?;
        parts.version = Version::HTTP_11;

        let host = match (&self.options.host_override, original_host) {
            (Some(host), _) => HeaderValue::from_str(host)
                .map_err(|e| Error::config(format!("host override '{host}': {e}")))?,
            (None, Some(original)) if self.options.preserve_host => original,
            _ => HeaderValue::from_str(self.director.authority().as_str())
                .map_err(|e| Error::Internal(format!("upstream authority: {e}")))?,
        };
        parts.headers.insert(header::HOST, host);

        remove_hop_headers(&mut parts.headers, self.options.no_cache);
        if let Some(conn) = &conn {
            add_forwarded_for(&mut parts.headers, conn);
        }
        inject_user_headers(&mut parts.headers, &self.options.upstream_headers);
        if let Some(user_agent) = &self.options.user_agent {
            rewrite_user_agent(&mut parts.headers, user_agent);
        }

        let upstream_uri = parts.uri.clone();
        let response = self.client.send(Request::from_parts(parts, body)).await?;

        let interval = hints.resolve(self.options.flush_interval, &response);
        let (mut parts, body) = response.into_parts();
        let trailers = declared_trailers(&parts.headers);
        remove_hop_headers(&mut parts.headers, self.options.no_cache);
        parts.headers.remove(header::USER_AGENT);
        inject_user_headers(&mut parts.headers, &self.options.downstream_headers);
        announce_trailers(&mut parts.headers, &trailers);

        tracing::debug!(
            category = "proxy",
            upstream = %upstream_uri,
            status = parts.status.as_u16(),
            flush = ?interval,
            "Upstream responded"
        );

        let hook: ExitHook = Box::new(move |bytes| {
            tracing::trace!(category = "proxy", upstream = %upstream_uri, bytes, "Response body relayed");
        });

        Ok(Response::from_parts(parts, stream_body(body, interval, Some(hook))))
    }

    /// Open a CONNECT tunnel to the request's authority
    pub async fn serve_connect(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("CONNECT without a target authority".to_string()))?;

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(Error::HijackUnsupported)?;

        let upstream = tokio::time::timeout(self.client.timeout(), TcpStream::connect(authority.as_str()))
            .await
            .map_err(|_| Error::UpstreamTimeout)?
            .map_err(|e| Error::Tunnel(format!("dial {authority}: {e}")))?;

        let deadline = Instant::now() + self.options.tunnel_timeout;

        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let outcome = relay(TokioIo::new(upgraded), upstream, deadline).await;
                    tracing::debug!(category = "tunnel", target = %authority, end = ?outcome.end, "Tunnel closed");
                }
                Err(e) => {
                    tracing::warn!(category = "tunnel", target = %authority, error = %e, "Connection upgrade failed");
                }
            }
        });

        Ok(Response::builder().status(StatusCode::OK).body(empty())?)
    }
}
