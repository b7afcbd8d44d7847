//! HTTP client for making requests to upstream services

use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use portcullis_core::{Body, Error, Result};
use std::time::Duration;

/// Idle pooled connections are closed after this long
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for upstream requests
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new() -> Self {
        Self::with_options(Duration::from_secs(30), 256)
    }

    /// Create a new HTTP client with custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_options(timeout, 256)
    }

    /// Create a client with a response-head timeout and idle pool size per host
    pub fn with_options(timeout: Duration, max_idle_per_host: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(max_idle_per_host)
            .build(connector);

        Self { client, timeout }
    }

    /// Send a request to the upstream named in its URI.
    ///
    /// The timeout covers connecting and receiving the response head; the
    /// body streams without a deadline.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        let timeout = tokio::time::timeout(self.timeout, self.client.request(req));

        match timeout.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::UpstreamConnection(e.to_string())),
            Err(_) => Err(Error::UpstreamTimeout),
        }
    }

    /// Get the configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_client_new() {
        let client = HttpClient::new();
        assert_eq!(client.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_http_client_with_timeout() {
        let client = HttpClient::with_timeout(Duration::from_secs(10));
        assert_eq!(client.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClient::with_timeout(Duration::from_secs(5));
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(portcullis_core::empty())
            .unwrap();

        let err = client.send(req).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamConnection(_)));
        assert!(err.is_transport());
    }
}
