//! Per-request pipeline
//!
//! Every request passes the stages in a fixed order: path blocks, redirects,
//! plugins, then the default upstream. The first stage that produces a
//! response ends the pipeline.

use http::{Method, Request, Response, StatusCode};
use portcullis_core::response::responses;
use portcullis_core::{full, Body, Result, TRUSTED_HEADERS};
use portcullis_plugins::{RouteOutcome, SniffRouter};
use portcullis_proxy::ForwardingEngine;
use portcullis_rules::{PathBlockTable, RedirectTable};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Pipeline stage that answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A path-block rule
    Block,
    /// A redirection rule
    Redirect,
    /// A plugin, through static or dynamic capture
    Plugin,
    /// The default upstream, including CONNECT tunnels
    Forward,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Block => "block",
            Stage::Redirect => "redirect",
            Stage::Plugin => "plugin",
            Stage::Forward => "forward",
        };
        f.write_str(name)
    }
}

/// Routes requests through the gateway stages
#[derive(Debug, Clone)]
pub struct Dispatcher {
    blocks: Arc<PathBlockTable>,
    redirects: Arc<RedirectTable>,
    plugins: Arc<SniffRouter>,
    engine: Arc<ForwardingEngine>,
}

impl Dispatcher {
    /// Create a dispatcher over explicitly constructed stages
    pub fn new(
        blocks: Arc<PathBlockTable>,
        redirects: Arc<RedirectTable>,
        plugins: Arc<SniffRouter>,
        engine: Arc<ForwardingEngine>,
    ) -> Self {
        Self {
            blocks,
            redirects,
            plugins,
            engine,
        }
    }

    /// Path-block table
    pub fn blocks(&self) -> &Arc<PathBlockTable> {
        &self.blocks
    }

    /// Redirection table
    pub fn redirects(&self) -> &Arc<RedirectTable> {
        &self.redirects
    }

    /// Plugin router
    pub fn plugins(&self) -> &Arc<SniffRouter> {
        &self.plugins
    }

    /// Serve one request; never fails, errors become status responses
    pub async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().to_string();

        for name in TRUSTED_HEADERS {
            req.headers_mut().remove(name);
        }

        let (stage, result) = self.dispatch(req).await;
        let latency = start.elapsed();

        match result {
            Ok(response) => {
                tracing::info!(
                    method = %method,
                    uri = %uri,
                    stage = %stage,
                    status = response.status().as_u16(),
                    latency_ms = %latency.as_millis(),
                    "Request completed"
                );
                response
            }
            Err(e) => {
                let status = e.to_status_code();
                tracing::error!(
                    method = %method,
                    uri = %uri,
                    stage = %stage,
                    status = status.as_u16(),
                    error = %e,
                    latency_ms = %latency.as_millis(),
                    "Request failed"
                );
                error_response(status)
            }
        }
    }

    async fn dispatch(&self, req: Request<Body>) -> (Stage, Result<Response<Body>>) {
        // CONNECT targets an authority, there is no path for the rule stages
        if req.method() == Method::CONNECT {
            return (Stage::Forward, self.engine.serve(req).await);
        }

        if let Some(rule) = self.blocks.check(req.uri().path()) {
            tracing::debug!(path = %req.uri().path(), rule = %rule.uuid, "Blocked by path rule");
            return (Stage::Block, rule.to_response());
        }

        if self.redirects.is_redirectable(&req) {
            return (Stage::Redirect, self.redirects.handle_redirect(&req));
        }

        let req = match self.plugins.route(req).await {
            Ok(RouteOutcome::Handled(response)) => return (Stage::Plugin, Ok(response)),
            Ok(RouteOutcome::NotHandled(req)) => req,
            Err(e) => return (Stage::Plugin, Err(e)),
        };

        (Stage::Forward, self.engine.serve(req).await)
    }
}

fn error_response(status: StatusCode) -> Response<Body> {
    responses::status_text(status, status_line(status)).unwrap_or_else(|_| {
        let mut response = Response::new(full(status_line(status)));
        *response.status_mut() = status;
        response
    })
}

fn status_line(status: StatusCode) -> String {
    format!(
        "{} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    )
}
