//! Configuration validation

use crate::Config;
use portcullis_core::{Error, Result};
use portcullis_proxy::Director;
use std::collections::HashSet;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_gateway(config)?;
    validate_upstream(config)?;
    validate_plugins(config)?;
    Ok(())
}

fn validate_gateway(config: &Config) -> Result<()> {
    if config.gateway.request_timeout.is_zero() {
        return Err(Error::Config("request_timeout must be > 0".to_string()));
    }

    if config.gateway.request_timeout.as_secs() > 300 {
        tracing::warn!("request_timeout is very high (>5 minutes)");
    }

    Ok(())
}

fn validate_upstream(config: &Config) -> Result<()> {
    let upstream = &config.upstream;

    if upstream.target.is_empty() {
        return Err(Error::Config("upstream target cannot be empty".to_string()));
    }

    // Same parse the forwarding engine performs; rejects non-http schemes
    Director::parse(&upstream.target)?;

    upstream.flush_interval()?;

    if upstream.tunnel_timeout.is_zero() {
        return Err(Error::Config("tunnel_timeout must be > 0".to_string()));
    }

    for rule in upstream.upstream_headers.iter().chain(&upstream.downstream_headers) {
        if http::HeaderName::from_bytes(rule.name.as_bytes()).is_err() {
            return Err(Error::Config(format!("invalid header name '{}'", rule.name)));
        }
    }

    Ok(())
}

fn validate_plugins(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();

    for plugin in &config.plugins {
        if plugin.id.is_empty() {
            return Err(Error::Config("plugin id cannot be empty".to_string()));
        }

        if !seen.insert(plugin.id.as_str()) {
            return Err(Error::Config(format!("duplicate plugin id '{}'", plugin.id)));
        }

        if plugin.port == 0 {
            return Err(Error::Config(format!("plugin '{}' port must be > 0", plugin.id)));
        }

        if plugin.dynamic_sniff.is_some() != plugin.dynamic_ingress.is_some() {
            return Err(Error::Config(format!(
                "plugin '{}' must declare both dynamic_sniff and dynamic_ingress or neither",
                plugin.id
            )));
        }

        if !plugin.static_capture_paths.is_empty() && plugin.static_ingress.is_none() {
            return Err(Error::Config(format!(
                "plugin '{}' declares static capture paths without static_ingress",
                plugin.id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use portcullis_plugins::PluginSpec;
    use std::time::Duration;

    fn minimal_config() -> Config {
        Config {
            gateway: GatewayConfig::new("127.0.0.1:8080".parse().unwrap()),
            upstream: UpstreamConfig::new("http://127.0.0.1:9000"),
            rules: RulesConfig::default(),
            plugins: vec![],
        }
    }

    fn plugin(id: &str) -> PluginSpec {
        PluginSpec {
            id: id.to_string(),
            port: 5874,
            dynamic_sniff: Some("/d_sniff".to_string()),
            dynamic_ingress: Some("/d_capture".to_string()),
            ..PluginSpec::default()
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = minimal_config();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = minimal_config();
        config.gateway.request_timeout = Duration::from_secs(0);

        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_non_http_upstream() {
        let mut config = minimal_config();
        config.upstream.target = "ftp://files.example".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_bad_header_rule() {
        let mut config = minimal_config();
        config.upstream.downstream_headers.push(portcullis_proxy::HeaderRule {
            name: "bad header".to_string(),
            value: String::new(),
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_plugin_checks() {
        let mut config = minimal_config();
        config.plugins = vec![plugin("a"), plugin("b")];
        assert!(validate_config(&config).is_ok());

        config.plugins.push(plugin("a"));
        assert!(validate_config(&config).unwrap_err().to_string().contains("duplicate"));

        let mut half = plugin("c");
        half.dynamic_ingress = None;
        config.plugins = vec![half];
        assert!(validate_config(&config).is_err());

        let mut statics = plugin("d");
        statics.static_capture_paths = vec!["/debug".to_string()];
        config.plugins = vec![statics];
        assert!(validate_config(&config).is_err());
    }
}
