//! Header normalization applied on both legs of a forward

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use portcullis_core::{ConnInfo, ORIGIN_UPGRADE_HEADER};
use serde::{Deserialize, Serialize};

/// Hop-by-hop headers always removed. `Connection` itself is kept.
const HOP_HEADERS: [&str; 7] = [
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";
const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const FASTLY_CLIENT_IP: &str = "fastly-client-ip";

/// A user-defined header rewrite. An empty value deletes the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    /// Header name
    pub name: String,

    /// Replacement value, empty to delete
    #[serde(default)]
    pub value: String,
}

impl HeaderRule {
    /// Set `name` to `value`
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Remove `name`
    pub fn delete(name: impl Into<String>) -> Self {
        Self::set(name, "")
    }
}

/// Strip hop-by-hop headers.
///
/// Removes every header named in `Connection` plus the fixed hop-by-hop set,
/// then restores `Upgrade` from the private escape header. With `no_cache`
/// the message is marked `Cache-Control: no-store`.
pub fn remove_hop_headers(headers: &mut HeaderMap, no_cache: bool) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }

    for name in HOP_HEADERS {
        headers.remove(name);
    }

    if let Some(upgrade) = headers.remove(ORIGIN_UPGRADE_HEADER) {
        headers.insert(header::UPGRADE, upgrade);
    }

    if no_cache {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

/// Append the client to `X-Forwarded-For` and fill `X-Forwarded-Proto` and `X-Real-Ip`
pub fn add_forwarded_for(headers: &mut HeaderMap, conn: &ConnInfo) {
    let client_ip = conn.remote_addr.ip().to_string();

    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    let proto = if conn.tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if !headers.contains_key(X_REAL_IP) {
        let real_ip = headers
            .get(CF_CONNECTING_IP)
            .or_else(|| headers.get(FASTLY_CLIENT_IP))
            .cloned()
            .or_else(|| {
                forwarded
                    .split(',')
                    .next()
                    .and_then(|first| HeaderValue::from_str(first.trim()).ok())
            });
        if let Some(real_ip) = real_ip {
            headers.insert(X_REAL_IP, real_ip);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Apply user-defined header rules in order
pub fn inject_user_headers(headers: &mut HeaderMap, rules: &[HeaderRule]) {
    for rule in rules {
        let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
            tracing::warn!(category = "proxy", header = %rule.name, "Skipping invalid header name");
            continue;
        };

        if rule.value.is_empty() {
            headers.remove(&name);
            continue;
        }

        match HeaderValue::from_str(&rule.value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => {
                tracing::warn!(category = "proxy", header = %rule.name, error = %e, "Skipping invalid header value");
            }
        }
    }
}

/// Give the request a user agent when the client sent none
pub fn rewrite_user_agent(headers: &mut HeaderMap, user_agent: &HeaderValue) {
    let missing = headers
        .get(header::USER_AGENT)
        .map_or(true, |v| v.is_empty());
    if missing {
        headers.insert(header::USER_AGENT, user_agent.clone());
    }
}

/// Trailer names announced by a `Trailer` header
pub fn declared_trailers(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::TRAILER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

/// Announce trailer names to the client
pub fn announce_trailers(headers: &mut HeaderMap, names: &[HeaderName]) {
    if names.is_empty() {
        return;
    }
    let joined = names
        .iter()
        .map(HeaderName::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(header::TRAILER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn conn(addr: &str) -> ConnInfo {
        ConnInfo::new(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_connection_listed_and_fixed_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("X-Custom, close"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("x-checksum"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-keep", HeaderValue::from_static("yes"));

        remove_hop_headers(&mut headers, false);

        assert!(headers.get("x-custom").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("te").is_none());
        assert!(headers.get("trailer").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get(header::CONNECTION).is_some());
        assert_eq!(headers.get("x-keep").unwrap(), "yes");
        assert!(headers.get(header::CACHE_CONTROL).is_none());
    }

    #[test]
    fn test_origin_upgrade_promoted_and_no_cache() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN_UPGRADE_HEADER, HeaderValue::from_static("websocket"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        remove_hop_headers(&mut headers, true);

        assert_eq!(headers.get(header::UPGRADE).unwrap(), "websocket");
        assert!(headers.get(ORIGIN_UPGRADE_HEADER).is_none());
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        add_forwarded_for(&mut headers, &conn("203.0.113.9:51234"));

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.9");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "203.0.113.9");
    }

    #[test]
    fn test_forwarded_for_appends_to_prior_values() {
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.2"));
        let mut info = conn("[2001:db8::1]:443");
        info.tls = true;

        add_forwarded_for(&mut headers, &info);

        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.1, 10.0.0.2, 2001:db8::1"
        );
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_real_ip_prefers_cdn_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(FASTLY_CLIENT_IP, HeaderValue::from_static("198.51.100.2"));
        headers.insert(CF_CONNECTING_IP, HeaderValue::from_static("198.51.100.1"));
        add_forwarded_for(&mut headers, &conn("127.0.0.1:1"));
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "198.51.100.1");

        let mut headers = HeaderMap::new();
        headers.insert(X_REAL_IP, HeaderValue::from_static("192.0.2.55"));
        add_forwarded_for(&mut headers, &conn("127.0.0.1:1"));
        assert_eq!(headers.get(X_REAL_IP).unwrap(), "192.0.2.55");
    }

    #[test]
    fn test_user_header_rules() {
        let mut headers = HeaderMap::new();
        headers.insert("x-remove-me", HeaderValue::from_static("1"));
        headers.append("x-replace", HeaderValue::from_static("a"));
        headers.append("x-replace", HeaderValue::from_static("b"));

        inject_user_headers(
            &mut headers,
            &[
                HeaderRule::delete("X-Remove-Me"),
                HeaderRule::set("X-Replace", "c"),
                HeaderRule::set("X-Added", "d"),
                HeaderRule::set("bad header", "e"),
            ],
        );

        assert!(headers.get("x-remove-me").is_none());
        let replaced: Vec<_> = headers.get_all("x-replace").iter().collect();
        assert_eq!(replaced, vec!["c"]);
        assert_eq!(headers.get("x-added").unwrap(), "d");
    }

    #[test]
    fn test_user_agent_only_filled_when_missing() {
        let ua = HeaderValue::from_static("portcullis/0.1.0");

        let mut headers = HeaderMap::new();
        rewrite_user_agent(&mut headers, &ua);
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "portcullis/0.1.0");

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        rewrite_user_agent(&mut headers, &ua);
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "curl/8.0");
    }

    #[test]
    fn test_trailer_names_survive_strip() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRAILER, HeaderValue::from_static("X-Checksum, X-Count"));

        let names = declared_trailers(&headers);
        remove_hop_headers(&mut headers, false);
        assert!(headers.get(header::TRAILER).is_none());

        announce_trailers(&mut headers, &names);
        assert_eq!(headers.get(header::TRAILER).unwrap(), "x-checksum, x-count");
    }
}
