//! Configuration types

use portcullis_core::{Error, Result};
use portcullis_plugins::PluginSpec;
use portcullis_proxy::{FlushInterval, HeaderRule, DEFAULT_TUNNEL_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Gateway configuration
    pub gateway: GatewayConfig,

    /// Default upstream every unclaimed request is forwarded to
    pub upstream: UpstreamConfig,

    /// Rule table storage
    #[serde(default)]
    pub rules: RulesConfig,

    /// Plugins reachable on loopback ports
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Listen address
    pub listen: SocketAddr,

    /// Upstream connect and response-head timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Graceful shutdown timeout (wait for in-flight requests)
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Target URL, `http` only
    pub target: String,

    /// `"immediate"`, a duration such as `"100ms"`, or absent to disable
    #[serde(default)]
    pub flush_interval: Option<String>,

    /// CONNECT tunnel lifetime
    #[serde(default = "default_tunnel_timeout", with = "humantime_serde")]
    pub tunnel_timeout: Duration,

    /// Force `Cache-Control: no-store`
    #[serde(default)]
    pub no_cache: bool,

    /// Keep the client Host header
    #[serde(default)]
    pub preserve_host: bool,

    /// Fixed Host header sent upstream
    #[serde(default)]
    pub host_override: Option<String>,

    /// Header rules applied to upstream requests
    #[serde(default)]
    pub upstream_headers: Vec<HeaderRule>,

    /// Header rules applied to client responses
    #[serde(default)]
    pub downstream_headers: Vec<HeaderRule>,

    /// Idle pooled connections kept per upstream host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

impl UpstreamConfig {
    /// Upstream config for `target` with defaults
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            flush_interval: None,
            tunnel_timeout: default_tunnel_timeout(),
            no_cache: false,
            preserve_host: false,
            host_override: None,
            upstream_headers: Vec::new(),
            downstream_headers: Vec::new(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }

    /// Parsed flush interval
    pub fn flush_interval(&self) -> Result<FlushInterval> {
        match self.flush_interval.as_deref().map(str::trim) {
            None | Some("") | Some("disabled") => Ok(FlushInterval::Disabled),
            Some("immediate") | Some("-1") => Ok(FlushInterval::Immediate),
            Some(text) => humantime_serde::re::humantime::parse_duration(text)
                .map(FlushInterval::Every)
                .map_err(|e| Error::config(format!("flush_interval '{text}': {e}"))),
        }
    }
}

/// Where rule tables persist their records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RulesConfig {
    /// Redirection rule directory
    pub redirect_dir: PathBuf,

    /// Path-block rule directory
    pub block_dir: PathBuf,

    /// Treat redirect keys as regular expressions
    pub allow_regex: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            redirect_dir: PathBuf::from("./conf/redirect"),
            block_dir: PathBuf::from("./conf/pathblock"),
            allow_regex: false,
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tunnel_timeout() -> Duration {
    DEFAULT_TUNNEL_TIMEOUT
}

fn default_max_idle_per_host() -> usize {
    256
}

impl GatewayConfig {
    /// Gateway config listening on `listen` with default timeouts
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            request_timeout: default_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_interval_parsing() {
        let mut upstream = UpstreamConfig::new("http://127.0.0.1:9000");
        assert_eq!(upstream.flush_interval().unwrap(), FlushInterval::Disabled);

        upstream.flush_interval = Some("immediate".to_string());
        assert_eq!(upstream.flush_interval().unwrap(), FlushInterval::Immediate);

        upstream.flush_interval = Some("100ms".to_string());
        assert_eq!(
            upstream.flush_interval().unwrap(),
            FlushInterval::Every(Duration::from_millis(100))
        );

        upstream.flush_interval = Some("soon".to_string());
        assert!(matches!(upstream.flush_interval(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rules_defaults() {
        let rules: RulesConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(rules.redirect_dir, PathBuf::from("./conf/redirect"));
        assert!(!rules.allow_regex);
    }
}
