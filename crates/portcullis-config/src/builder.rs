//! Configuration builder

use crate::types::{Config, GatewayConfig, RulesConfig, UpstreamConfig};
use portcullis_plugins::PluginSpec;
use std::net::SocketAddr;
use std::path::Path;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    gateway: Option<GatewayConfig>,
    upstream: Option<UpstreamConfig>,
    rules: RulesConfig,
    plugins: Vec<PluginSpec>,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set gateway configuration
    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.gateway.get_or_insert_with(|| GatewayConfig::new(addr)).listen = addr;
        self
    }

    /// Set upstream configuration
    pub fn upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Set the upstream target, keeping other upstream settings
    pub fn target(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        match &mut self.upstream {
            Some(upstream) => upstream.target = target,
            None => self.upstream = Some(UpstreamConfig::new(target)),
        }
        self
    }

    /// Store rule tables under `root`
    pub fn rules_root(mut self, root: &Path) -> Self {
        self.rules.redirect_dir = root.join("redirect");
        self.rules.block_dir = root.join("pathblock");
        self
    }

    /// Treat redirect keys as regular expressions
    pub fn allow_regex(mut self, allow: bool) -> Self {
        self.rules.allow_regex = allow;
        self
    }

    /// Add a plugin
    pub fn plugin(mut self, plugin: PluginSpec) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> portcullis_core::Result<Config> {
        let gateway = self
            .gateway
            .ok_or_else(|| portcullis_core::Error::Config("gateway is required".to_string()))?;
        let upstream = self
            .upstream
            .ok_or_else(|| portcullis_core::Error::Config("upstream is required".to_string()))?;

        let config = Config {
            gateway,
            upstream,
            rules: self.rules,
            plugins: self.plugins,
        };
        crate::validator::validate_config(&config)?;
        Ok(config)
    }
}
