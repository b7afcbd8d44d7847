//! Gateway-side plugin routing
//!
//! Static capture paths are tried first, longest prefix wins. Otherwise every
//! plugin with a dynamic sniff endpoint is asked in registration order
//! whether it wants the request; the first one answering `200` receives it
//! through its capture ingress, tagged with the same forward id that was
//! sent with the sniff.

use crate::snapshot::SniffSnapshot;
use arc_swap::ArcSwap;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use portcullis_core::{full, Body, Error, Result, CAPTURE_HEADER, CAPTURE_URI_HEADER, FORWARD_ID_HEADER};
use portcullis_proxy::{ForwardOptions, ForwardingEngine, HttpClient};
use portcullis_rules::{MatchMode, MatchRule, RuleIndex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Plugins listen on the loopback interface
const PLUGIN_HOST: &str = "127.0.0.1";

/// Declared routing surface of a running plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique plugin identifier
    pub id: String,

    /// Loopback port the plugin listens on
    pub port: u16,

    /// Sniff endpoint path
    #[serde(default)]
    pub dynamic_sniff: Option<String>,

    /// Dynamic capture ingress path
    #[serde(default)]
    pub dynamic_ingress: Option<String>,

    /// Request path prefixes the plugin claims outright
    #[serde(default)]
    pub static_capture_paths: Vec<String>,

    /// Static capture ingress path
    #[serde(default)]
    pub static_ingress: Option<String>,
}

impl PluginSpec {
    /// Whether both dynamic endpoints are declared
    pub fn accepts_dynamic_route(&self) -> bool {
        matches!((&self.dynamic_sniff, &self.dynamic_ingress), (Some(s), Some(i)) if !s.is_empty() && !i.is_empty())
    }

    fn base_url(&self, path: &str) -> String {
        format!("http://{PLUGIN_HOST}:{}{path}", self.port)
    }
}

/// Leading slash, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Verdict of a sniff endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffResult {
    /// The plugin takes the request
    Accept,
    /// Ask the next plugin
    Skip,
}

impl SniffResult {
    /// Status code a sniff endpoint answers with
    pub fn status(&self) -> StatusCode {
        match self {
            SniffResult::Accept => StatusCode::OK,
            SniffResult::Skip => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Interpret a sniff endpoint status
    pub fn from_status(plugin: &str, status: StatusCode) -> Result<Self> {
        match status {
            StatusCode::OK => Ok(SniffResult::Accept),
            StatusCode::NOT_IMPLEMENTED => Ok(SniffResult::Skip),
            other => Err(Error::plugin(plugin, format!("unexpected sniff verdict {other}"))),
        }
    }
}

/// Outcome of [`SniffRouter::route`]
#[derive(Debug)]
pub enum RouteOutcome {
    /// A plugin produced the response
    Handled(Response<Body>),
    /// No plugin claimed the request, which is handed back untouched
    NotHandled(Request<Body>),
}

#[derive(Debug)]
struct DynamicRoute {
    id: String,
    sniff_url: String,
    engine: ForwardingEngine,
}

/// A static capture path owned by one plugin
#[derive(Debug)]
pub struct StaticCapture {
    path: String,
    plugin_id: String,
    engine: ForwardingEngine,
}

impl StaticCapture {
    /// Owning plugin
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Captured prefix
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl MatchRule for StaticCapture {
    fn key(&self) -> &str {
        &self.path
    }

    fn exact_match(&self) -> bool {
        false
    }

    fn case_sensitive(&self) -> bool {
        true
    }

    fn enabled(&self) -> bool {
        true
    }
}

/// Routes requests to plugins
#[derive(Debug)]
pub struct SniffRouter {
    dynamic: ArcSwap<Vec<Arc<DynamicRoute>>>,
    statics: RuleIndex<StaticCapture>,
    client: HttpClient,
}

impl SniffRouter {
    /// Create a router using `client` for sniffs and forwards
    pub fn new(client: HttpClient) -> Self {
        Self {
            dynamic: ArcSwap::from_pointee(Vec::new()),
            statics: RuleIndex::new(MatchMode::Literal),
            client,
        }
    }

    fn plugin_engine(&self, target: String) -> Result<ForwardingEngine> {
        let options = ForwardOptions {
            no_cache: true,
            preserve_host: true,
            ..ForwardOptions::default()
        };
        ForwardingEngine::new(&target, self.client.clone(), options)
    }

    /// Register everything a plugin declares
    pub fn register(&self, spec: &PluginSpec) -> Result<()> {
        if spec.accepts_dynamic_route() {
            self.register_dynamic(spec)?;
        }
        for path in &spec.static_capture_paths {
            if let Err(e) = self.register_static_capture(path, spec) {
                tracing::error!(category = "plugins", plugin = %spec.id, path = %path, error = %e, "Static capture rejected");
            }
        }
        Ok(())
    }

    /// Register a plugin's dynamic sniff and capture endpoints
    pub fn register_dynamic(&self, spec: &PluginSpec) -> Result<()> {
        let (Some(sniff), Some(ingress)) = (&spec.dynamic_sniff, &spec.dynamic_ingress) else {
            return Err(Error::plugin(&spec.id, "dynamic routing needs both sniff and ingress paths"));
        };
        if self.dynamic.load().iter().any(|route| route.id == spec.id) {
            return Err(Error::plugin(&spec.id, "dynamic route already registered"));
        }

        let sniff = normalize_path(sniff);
        let ingress = normalize_path(ingress);
        let route = Arc::new(DynamicRoute {
            id: spec.id.clone(),
            sniff_url: spec.base_url(&format!("{sniff}/")),
            engine: self.plugin_engine(spec.base_url(&ingress))?,
        });

        self.dynamic.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&route));
            next
        });

        tracing::info!(category = "plugins", plugin = %spec.id, sniff = %sniff, ingress = %ingress, "Dynamic capture registered");
        Ok(())
    }

    /// Claim a static capture path for a plugin.
    ///
    /// A path already owned by another plugin is rejected and both plugins
    /// are reported as incompatible.
    pub fn register_static_capture(&self, path: &str, spec: &PluginSpec) -> Result<()> {
        let Some(ingress) = &spec.static_ingress else {
            return Err(Error::plugin(&spec.id, "static capture needs a static ingress path"));
        };
        let path = path.trim_end_matches('/').to_string();

        if let Some(existing) = self.statics.get(&path) {
            if existing.plugin_id == spec.id {
                tracing::warn!(category = "plugins", plugin = %spec.id, path = %path, "Duplicate static capture path");
                return Ok(());
            }
            tracing::error!(
                category = "plugins",
                path = %path,
                first = %existing.plugin_id,
                second = %spec.id,
                "Incompatible plugins claim the same capture path"
            );
            return Err(Error::plugin(
                &spec.id,
                format!("capture path {path} already owned by {}", existing.plugin_id),
            ));
        }

        let capture = StaticCapture {
            path: path.clone(),
            plugin_id: spec.id.clone(),
            engine: self.plugin_engine(spec.base_url(&normalize_path(ingress)))?,
        };
        self.statics.try_insert(path.clone(), capture)?;

        tracing::info!(category = "plugins", plugin = %spec.id, path = %path, "Static capture path assigned");
        Ok(())
    }

    /// Drop every route belonging to `plugin_id`
    pub fn unregister(&self, plugin_id: &str) {
        self.dynamic.rcu(|current| {
            current
                .iter()
                .filter(|route| route.id != plugin_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        for capture in self.statics.snapshot() {
            if capture.plugin_id == plugin_id {
                self.statics.remove(&capture.path);
            }
        }
    }

    /// Ids of plugins with dynamic routes, in registration order
    pub fn dynamic_plugins(&self) -> Vec<String> {
        self.dynamic.load().iter().map(|route| route.id.clone()).collect()
    }

    /// Static capture owning `path`, if any
    pub fn static_capture_for(&self, path: &str) -> Option<Arc<StaticCapture>> {
        self.statics.best_match_path(path).map(|m| m.rule)
    }

    /// Offer a request to the plugins
    pub async fn route(&self, req: Request<Body>) -> Result<RouteOutcome> {
        if let Some(capture) = self.static_capture_for(req.uri().path()) {
            return self.forward_static(&capture, req).await.map(RouteOutcome::Handled);
        }

        let routes = self.dynamic.load_full();
        if routes.is_empty() {
            return Ok(RouteOutcome::NotHandled(req));
        }

        let payload = SniffSnapshot::from_request(&req).encode()?;
        for route in routes.iter() {
            let forward_id = Uuid::new_v4().to_string();
            match self.sniff(route, &payload, &forward_id).await {
                Ok(SniffResult::Accept) => {
                    tracing::debug!(category = "plugins", plugin = %route.id, forward_id = %forward_id, "Plugin accepted request");
                    let mut req = req;
                    let id = HeaderValue::from_str(&forward_id)
                        .map_err(|e| Error::Internal(format!("forward id: {e}")))?;
                    req.headers_mut().insert(FORWARD_ID_HEADER, id);
                    return route.engine.serve(req).await.map(RouteOutcome::Handled);
                }
                Ok(SniffResult::Skip) => {
                    tracing::trace!(category = "plugins", plugin = %route.id, "Plugin skipped request");
                }
                Err(e) => {
                    tracing::error!(category = "plugins", plugin = %route.id, error = %e, "Sniff failed");
                }
            }
        }

        Ok(RouteOutcome::NotHandled(req))
    }

    async fn sniff(&self, route: &DynamicRoute, payload: &[u8], forward_id: &str) -> Result<SniffResult> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(&route.sniff_url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(FORWARD_ID_HEADER, forward_id)
            .body(full(payload.to_vec()))?;

        let response = self
            .client
            .send(req)
            .await
            .map_err(|e| Error::plugin(&route.id, e.to_string()))?;
        let status = response.status();

        // Drain so the pooled connection can be reused
        let _ = response.into_body().collect().await;

        SniffResult::from_status(&route.id, status)
    }

    async fn forward_static(&self, capture: &StaticCapture, mut req: Request<Body>) -> Result<Response<Body>> {
        let original = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let rewritten = strip_capture_prefix(&original, &capture.path);
        *req.uri_mut() = rewritten
            .parse::<Uri>()
            .map_err(|e| Error::InvalidRequest(format!("capture rewrite: {e}")))?;

        let headers = req.headers_mut();
        headers.insert(
            CAPTURE_HEADER,
            HeaderValue::from_str(&capture.path).map_err(|e| Error::Internal(e.to_string()))?,
        );
        headers.insert(
            CAPTURE_URI_HEADER,
            HeaderValue::from_str(&original).map_err(|e| Error::InvalidRequest(e.to_string()))?,
        );

        tracing::debug!(category = "plugins", plugin = %capture.plugin_id, capture = %capture.path, uri = %original, "Static capture");
        capture.engine.serve(req).await
    }
}

/// Remove a capture prefix once from the path, leaving the query untouched
pub fn strip_capture_prefix(uri: &str, prefix: &str) -> String {
    let (path, query) = split_query(uri);
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    format!("{}{query}", clean_path(rest))
}

/// Split a path-and-query into the path and the `?query` suffix
pub(crate) fn split_query(uri: &str) -> (&str, &str) {
    match uri.find('?') {
        Some(at) => uri.split_at(at),
        None => (uri, ""),
    }
}

/// Collapse runs of `/` and ensure a single leading slash
pub(crate) fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> PluginSpec {
        PluginSpec {
            id: id.to_string(),
            port: 1,
            dynamic_sniff: Some("sniff/".to_string()),
            dynamic_ingress: Some("/capture".to_string()),
            static_capture_paths: Vec::new(),
            static_ingress: Some("/static_capture".to_string()),
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("sniff/"), "/sniff");
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_strip_capture_prefix() {
        assert_eq!(strip_capture_prefix("/debug/info?x=1", "/debug"), "/info?x=1");
        assert_eq!(strip_capture_prefix("/debug", "/debug"), "/");
        assert_eq!(strip_capture_prefix("/debug//deep", "/debug"), "/deep");
        assert_eq!(strip_capture_prefix("/debugger", "/debug"), "/ger");
        assert_eq!(strip_capture_prefix("/debug?x=1", "/debug"), "/?x=1");
        assert_eq!(
            strip_capture_prefix("/debug///a//b?next=http://x//y", "/debug"),
            "/a/b?next=http://x//y"
        );
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(SniffResult::from_status("p", StatusCode::OK).unwrap(), SniffResult::Accept);
        assert_eq!(
            SniffResult::from_status("p", StatusCode::NOT_IMPLEMENTED).unwrap(),
            SniffResult::Skip
        );
        let err = SniffResult::from_status("p", StatusCode::INTERNAL_SERVER_ERROR).unwrap_err();
        assert!(matches!(err, Error::Plugin { .. }));
    }

    #[test]
    fn test_dynamic_registration_order_and_duplicates() {
        let router = SniffRouter::new(HttpClient::new());
        router.register_dynamic(&spec("first")).unwrap();
        router.register_dynamic(&spec("second")).unwrap();
        assert!(router.register_dynamic(&spec("first")).is_err());

        let mut half = spec("half");
        half.dynamic_ingress = None;
        assert!(!half.accepts_dynamic_route());
        assert!(router.register_dynamic(&half).is_err());

        assert_eq!(router.dynamic_plugins(), vec!["first", "second"]);
        router.unregister("first");
        assert_eq!(router.dynamic_plugins(), vec!["second"]);
    }

    #[test]
    fn test_static_capture_longest_prefix_and_conflicts() {
        let router = SniffRouter::new(HttpClient::new());
        router.register_static_capture("/debug/", &spec("a")).unwrap();
        router.register_static_capture("/debug/deep", &spec("b")).unwrap();

        let conflict = router.register_static_capture("/debug", &spec("c"));
        assert!(matches!(conflict, Err(Error::Plugin { .. })));
        router.register_static_capture("/debug", &spec("a")).unwrap();

        assert_eq!(router.static_capture_for("/debug/x").unwrap().plugin_id(), "a");
        assert_eq!(router.static_capture_for("/debug/deep/x").unwrap().plugin_id(), "b");
        assert!(router.static_capture_for("/other").is_none());

        router.unregister("b");
        assert_eq!(router.static_capture_for("/debug/deep/x").unwrap().plugin_id(), "a");
    }

    #[tokio::test]
    async fn test_route_without_plugins_returns_request() {
        let router = SniffRouter::new(HttpClient::new());
        let req = Request::builder().uri("/x").body(portcullis_core::empty()).unwrap();
        match router.route(req).await.unwrap() {
            RouteOutcome::NotHandled(req) => assert_eq!(req.uri().path(), "/x"),
            RouteOutcome::Handled(_) => panic!("nothing should claim the request"),
        }
    }
}
