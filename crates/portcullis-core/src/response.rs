//! Response builder and utilities

use crate::types::{empty, full, Body};
use crate::Result;
use http::{header, HeaderName, HeaderValue, Response, StatusCode};

/// Response builder for convenient response construction
#[derive(Debug)]
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl ResponseBuilder {
    /// Create a new response builder
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Append a header. Repeated names are kept in insertion order.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Build response with empty body
    pub fn build(self) -> Result<Response<Body>> {
        self.body(empty())
    }

    /// Build response with text body
    pub fn text(self, body: impl Into<String>) -> Result<Response<Body>> {
        self.header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(full(body.into()))
    }

    /// Build response with the given body
    pub fn body(self, body: Body) -> Result<Response<Body>> {
        let mut response = Response::builder().status(self.status);

        for (name, value) in self.headers {
            response = response.header(name, value);
        }

        Ok(response.body(body)?)
    }
}

/// Convenience functions for common responses
pub mod responses {
    use super::*;

    /// 500 Internal Server Error
    pub fn internal_error(message: impl Into<String>) -> Result<Response<Body>> {
        ResponseBuilder::new(StatusCode::INTERNAL_SERVER_ERROR).text(message)
    }

    /// 502 Bad Gateway
    pub fn bad_gateway(message: impl Into<String>) -> Result<Response<Body>> {
        ResponseBuilder::new(StatusCode::BAD_GATEWAY).text(message)
    }

    /// Plain-text response with an arbitrary status
    pub fn status_text(status: StatusCode, message: impl Into<String>) -> Result<Response<Body>> {
        ResponseBuilder::new(status).text(message)
    }

    /// Redirect with a `Location` header
    pub fn redirect(status: StatusCode, location: &str) -> Result<Response<Body>> {
        let location = HeaderValue::from_str(location)
            .map_err(|e| crate::Error::InvalidRequest(format!("Invalid redirect target: {e}")))?;
        ResponseBuilder::new(status)
            .header(header::LOCATION, location)
            .build()
    }
}
