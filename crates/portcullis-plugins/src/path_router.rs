//! Plugin-side request router
//!
//! A plugin embeds a [`PathRouter`] and serves it on its loopback port. The
//! gateway reaches it on three kinds of ingress: the sniff endpoint, the
//! dynamic capture ingress and the static capture ingress. Anything else goes
//! to the default handler.

use crate::router::{clean_path, normalize_path, split_query, SniffResult};
use crate::snapshot::SniffSnapshot;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use portcullis_core::{
    full, Body, Error, Result, ResponseBuilder, CAPTURE_HEADER, CAPTURE_URI_HEADER, FORWARD_ID_HEADER,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Async request handler
pub type RequestHandler = Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Response<Body>> + Send + Sync>;

/// Sniff decision function
pub type SniffHandler = Arc<dyn Fn(&SniffSnapshot) -> SniffResult + Send + Sync>;

/// Wrap an async closure as a [`RequestHandler`]
pub fn handler_fn<F, Fut>(f: F) -> RequestHandler
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// What serves a mount point
#[derive(Clone)]
pub enum Handler {
    /// Answers the gateway's accept/skip question
    Sniff(SniffHandler),
    /// Receives dynamically captured requests
    Capture(RequestHandler),
    /// Dispatches statically captured requests to path handlers
    Static,
    /// Receives everything no mount claims
    Default(RequestHandler),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Handler::Sniff(_) => "Sniff",
            Handler::Capture(_) => "Capture",
            Handler::Static => "Static",
            Handler::Default(_) => "Default",
        };
        f.write_str(kind)
    }
}

/// Routes gateway traffic inside a plugin
#[derive(Debug, Default, Clone)]
pub struct PathRouter {
    mounts: Vec<(String, Handler)>,
    path_handlers: HashMap<String, PathHandler>,
    default: Option<Handler>,
}

#[derive(Clone)]
struct PathHandler(RequestHandler);

impl std::fmt::Debug for PathHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PathHandler")
    }
}

impl PathRouter {
    /// Empty router
    pub fn new() -> Self {
        Self::default()
    }

    fn mount(&mut self, ingress: &str, handler: Handler) {
        let ingress = normalize_path(ingress);
        self.mounts.retain(|(existing, _)| *existing != ingress);
        tracing::debug!(category = "plugin-sdk", ingress = %ingress, handler = ?handler, "Mounted");
        self.mounts.push((ingress, handler));
    }

    /// Answer sniff requests on `ingress`
    pub fn register_dynamic_sniff_handler<F>(&mut self, ingress: &str, f: F) -> &mut Self
    where
        F: Fn(&SniffSnapshot) -> SniffResult + Send + Sync + 'static,
    {
        self.mount(ingress, Handler::Sniff(Arc::new(f)));
        self
    }

    /// Serve dynamically captured requests arriving on `ingress`
    pub fn register_dynamic_capture_handle(&mut self, ingress: &str, handler: RequestHandler) -> &mut Self {
        self.mount(ingress, Handler::Capture(handler));
        self
    }

    /// Serve statically captured requests arriving on `ingress`
    pub fn register_static_capture_ingress(&mut self, ingress: &str) -> &mut Self {
        self.mount(ingress, Handler::Static);
        self
    }

    /// Handler for one static capture path
    pub fn register_path_handler(&mut self, path: &str, handler: RequestHandler) -> &mut Self {
        self.path_handlers
            .insert(path.trim_end_matches('/').to_string(), PathHandler(handler));
        self
    }

    /// Forget a static capture path handler
    pub fn remove_path_handler(&mut self, path: &str) -> &mut Self {
        self.path_handlers.remove(path.trim_end_matches('/'));
        self
    }

    /// Handler for requests nothing else claims
    pub fn set_default_handler(&mut self, handler: RequestHandler) -> &mut Self {
        self.default = Some(Handler::Default(handler));
        self
    }

    fn select(&self, path: &str) -> Option<(&str, &Handler)> {
        self.mounts
            .iter()
            .filter(|(ingress, _)| {
                ingress == "/"
                    || path == ingress
                    || path.strip_prefix(ingress.as_str()).is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(ingress, _)| ingress.len())
            .map(|(ingress, handler)| (ingress.as_str(), handler))
            .or_else(|| self.default.as_ref().map(|handler| ("", handler)))
    }

    /// Serve one request
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        let result = match self.select(&path) {
            Some((_, Handler::Sniff(sniff))) => Self::serve_sniff(sniff, req).await,
            Some((ingress, Handler::Capture(capture))) => {
                let ingress = ingress.to_string();
                Self::serve_capture(capture, &ingress, req).await
            }
            Some((_, Handler::Static)) => self.serve_static(req).await,
            Some((_, Handler::Default(fallback))) => Ok(fallback(req).await),
            None => Ok(Self::unhandled(&path)),
        };

        result.unwrap_or_else(|e| {
            tracing::error!(category = "plugin-sdk", path = %path, error = %e, "Request failed");
            error_response(e.to_status_code(), &e.to_string())
        })
    }

    async fn serve_sniff(sniff: &SniffHandler, req: Request<Body>) -> Result<Response<Body>> {
        let forward_id = req
            .headers()
            .get(FORWARD_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let payload = req.into_body().collect().await?.to_bytes();
        let snapshot = match SniffSnapshot::decode(&payload) {
            Ok(snapshot) => snapshot.with_forward_uuid(forward_id),
            Err(e) => {
                tracing::error!(
                    category = "plugin-sdk",
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Sniff payload decode failed"
                );
                return ResponseBuilder::new(StatusCode::INTERNAL_SERVER_ERROR).text("500 - Internal Server Error");
            }
        };

        match sniff(&snapshot) {
            SniffResult::Accept => ResponseBuilder::new(SniffResult::Accept.status()).text("OK"),
            SniffResult::Skip => ResponseBuilder::new(SniffResult::Skip.status()).text("SKIP"),
        }
    }

    async fn serve_capture(capture: &RequestHandler, ingress: &str, mut req: Request<Body>) -> Result<Response<Body>> {
        let original = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let restored = strip_ingress(&original, ingress);
        *req.uri_mut() = parse_uri(&restored)?;
        Ok(capture(req).await)
    }

    async fn serve_static(&self, mut req: Request<Body>) -> Result<Response<Body>> {
        let capture = req
            .headers()
            .get(CAPTURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(capture) = capture.filter(|c| !c.is_empty()) {
            tracing::debug!(category = "plugin-sdk", capture = %capture, "Using capture path");
            if let Some(PathHandler(handler)) = self.path_handlers.get(capture.trim_end_matches('/')) {
                let original = req
                    .headers()
                    .get(CAPTURE_URI_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                if let Some(original) = original {
                    *req.uri_mut() = parse_uri(&original)?;
                }
                return Ok(handler(req).await);
            }
        }

        match &self.default {
            Some(Handler::Default(fallback)) => Ok(fallback(req).await),
            _ => Ok(Self::unhandled(req.uri().path())),
        }
    }

    fn unhandled(path: &str) -> Response<Body> {
        tracing::error!(category = "plugin-sdk", path = %path, "No handler registered for path");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("500 - no handler registered for {path}"),
        )
    }

    /// Serve the router on `listener` until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await?;
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let router = Arc::clone(&router);
                    async move { Ok::<_, Infallible>(router.handle(req.map(|b| b.boxed())).await) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(category = "plugin-sdk", error = %e, "Connection closed with error");
                }
            });
        }
    }
}

/// Strip the ingress prefix once from the path.
///
/// The ingress itself maps to `/`. Slashes are collapsed in the path only,
/// the query is passed through unchanged.
pub fn strip_ingress(uri: &str, ingress: &str) -> String {
    let ingress = ingress.trim_end_matches('/');
    let (path, query) = split_query(uri);
    let rest = if path == ingress {
        ""
    } else {
        path.strip_prefix(ingress)
            .filter(|rest| rest.starts_with('/'))
            .unwrap_or(path)
    };
    format!("{}{query}", clean_path(rest))
}

fn parse_uri(path: &str) -> Result<Uri> {
    path.parse::<Uri>()
        .map_err(|e| Error::InvalidRequest(format!("rewritten path '{path}': {e}")))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = status;
    response
}
