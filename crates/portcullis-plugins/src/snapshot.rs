//! Plugin-facing projection of an inbound request

use http::{header, Request, Version};
use portcullis_core::{ConnInfo, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a plugin sees when asked whether it wants a request.
///
/// This is a value copy; the live request stays with the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SniffSnapshot {
    /// Request method
    pub method: String,

    /// Host the client addressed
    pub hostname: String,

    /// Request URI as received
    pub url: String,

    /// Request headers, multiple values kept
    pub header: BTreeMap<String, Vec<String>>,

    /// Client address
    pub remote_addr: String,

    /// Host header
    pub host: String,

    /// Path and query
    pub request_uri: String,

    /// Protocol name, e.g. `HTTP/1.1`
    pub proto: String,

    /// Protocol major version
    pub proto_major: u8,

    /// Protocol minor version
    pub proto_minor: u8,

    #[serde(skip)]
    pub(crate) forward_uuid: String,
}

impl SniffSnapshot {
    /// Project a request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in req.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let remote_addr = req
            .extensions()
            .get::<ConnInfo>()
            .map(|c| c.remote_addr.to_string())
            .unwrap_or_default();

        let (proto, proto_major, proto_minor) = match req.version() {
            Version::HTTP_09 => ("HTTP/0.9", 0, 9),
            Version::HTTP_10 => ("HTTP/1.0", 1, 0),
            Version::HTTP_2 => ("HTTP/2.0", 2, 0),
            Version::HTTP_3 => ("HTTP/3.0", 3, 0),
            _ => ("HTTP/1.1", 1, 1),
        };

        Self {
            method: req.method().to_string(),
            hostname: host.clone(),
            url: req.uri().to_string(),
            header: headers,
            remote_addr,
            host,
            request_uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            forward_uuid: String::new(),
        }
    }

    /// Serialize for the sniff endpoint
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a sniff payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::SnapshotDecode(e.to_string()))
    }

    /// Correlation id stamped by the gateway.
    ///
    /// Empty when the snapshot did not arrive through the dynamic router;
    /// treat such snapshots with suspicion.
    pub fn forward_uuid(&self) -> &str {
        &self.forward_uuid
    }

    /// Attach the correlation id
    pub fn with_forward_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.forward_uuid = uuid.into();
        self
    }

    /// First value of a header, by lowercase name
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.header
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}
