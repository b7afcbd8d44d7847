//! # Portcullis Configuration
//!
//! Gateway configuration with support for:
//! - Multiple formats (YAML, TOML, JSON)
//! - `${VAR}` and `${VAR:-default}` expansion
//! - Validation
//! - Default values

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod types;
pub mod validator;

pub use builder::ConfigBuilder;
pub use loader::{expand_env_vars, load_config, load_from_file, load_from_str, ConfigFormat};
pub use types::{Config, GatewayConfig, RulesConfig, UpstreamConfig};
pub use validator::validate_config;
