//! Configuration loading

use crate::Config;
use portcullis_core::{Error, Result};
use regex::Regex;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

/// Syntax of a gateway configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.yaml` / `.yml`
    Yaml,
    /// `.toml`
    Toml,
    /// `.json`
    Json,
}

impl ConfigFormat {
    /// Pick the syntax from a file extension, ignoring case.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                Error::config(format!(
                    "{}: config file needs a .yaml, .toml or .json extension",
                    path.display()
                ))
            })?;

        match ext.as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(Error::config(format!(
                "{}: unsupported config extension '.{other}'",
                path.display()
            ))),
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigFormat::Yaml => "YAML",
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Json => "JSON",
        })
    }
}

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {e}", path.display())))?;

    let format = ConfigFormat::from_path(path)?;

    let expanded = expand_env_vars(&content)?;
    parse(&expanded, format)
        .map_err(|e| Error::config(format!("{}: invalid {format} gateway config: {e}", path.display())))
}

/// Expand environment variables in configuration text.
///
/// Supports `${VAR}` and `${VAR:-default}`; an unset variable without a
/// default is an error.
pub fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match (env::var(var_name), default_value) {
            (Ok(val), _) => val,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(Error::Config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let expanded = expand_env_vars(content)?;
    parse(&expanded, format).map_err(|e| Error::config(format!("invalid {format} gateway config: {e}")))
}

fn parse(content: &str, format: ConfigFormat) -> std::result::Result<Config, String> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    }
}

/// Load and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const YAML_CONFIG: &str = r#"
gateway:
  listen: "127.0.0.1:8080"
  request_timeout: "10s"

upstream:
  target: "http://127.0.0.1:9000/app"
  flush_interval: "100ms"
  no_cache: true
  upstream_headers:
    - name: "X-Env"
      value: "prod"
    - name: "X-Debug"

rules:
  redirect_dir: "/var/lib/portcullis/redirect"
  block_dir: "/var/lib/portcullis/pathblock"

plugins:
  - id: "org.example.sniffer"
    port: 5874
    dynamic_sniff: "/d_sniff"
    dynamic_ingress: "/d_capture"
    static_capture_paths: ["/debug"]
    static_ingress: "/s_capture"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.gateway.request_timeout, Duration::from_secs(10));
        assert_eq!(config.gateway.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.upstream.target, "http://127.0.0.1:9000/app");
        assert!(config.upstream.no_cache);
        assert_eq!(config.upstream.upstream_headers.len(), 2);
        assert!(config.upstream.upstream_headers[1].value.is_empty());
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].static_capture_paths, vec!["/debug"]);
    }

    #[test]
    fn test_load_toml() {
        let toml = r#"
[gateway]
listen = "0.0.0.0:80"
shutdown_timeout = "5s"

[upstream]
target = "http://10.0.0.2:8080"
tunnel_timeout = "1m"
"#;
        let config = load_from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.gateway.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.upstream.tunnel_timeout, Duration::from_secs(60));
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_invalid_yaml() {
        let invalid = "invalid: [yaml";
        let err = load_from_str(invalid, ConfigFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("invalid YAML gateway config"));
    }

    #[test]
    fn test_format_follows_extension() {
        let cases = [
            ("/etc/portcullis/gateway.yml", ConfigFormat::Yaml),
            ("portcullis.YAML", ConfigFormat::Yaml),
            ("gateway.toml", ConfigFormat::Toml),
            ("rules/gateway.json", ConfigFormat::Json),
        ];
        for (path, expected) in cases {
            assert_eq!(ConfigFormat::from_path(Path::new(path)).unwrap(), expected, "{path}");
        }

        let err = ConfigFormat::from_path(Path::new("gateway.ini")).unwrap_err();
        assert!(err.to_string().contains("'.ini'"));
        assert!(ConfigFormat::from_path(Path::new("/etc/portcullis/gateway")).is_err());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(
            &path,
            r#"{"gateway": {"listen": "127.0.0.1:8081"}, "upstream": {"target": "http://127.0.0.1:9000"}}"#,
        )
        .unwrap();

        let config = load_from_file(&path).unwrap();
        assert_eq!(config.gateway.listen.to_string(), "127.0.0.1:8081");
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[gateway\n").unwrap();

        let err = load_from_file(&path).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken.toml"));
        assert!(message.contains("TOML"));
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("PORTCULLIS_TEST_PORT", "9090");
        env::set_var("PORTCULLIS_TEST_HOST", "0.0.0.0");

        let config_with_vars = r#"
gateway:
  listen: "${PORTCULLIS_TEST_HOST}:${PORTCULLIS_TEST_PORT}"
upstream:
  target: "http://${PORTCULLIS_TEST_UPSTREAM:-127.0.0.1:9000}"
"#;

        let config = load_from_str(config_with_vars, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.gateway.listen.to_string(), "0.0.0.0:9090");
        assert_eq!(config.upstream.target, "http://127.0.0.1:9000");

        env::remove_var("PORTCULLIS_TEST_PORT");
        env::remove_var("PORTCULLIS_TEST_HOST");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("PORTCULLIS_MISSING_VAR");

        let result = expand_env_vars("listen: \"${PORTCULLIS_MISSING_VAR}\"");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("PORTCULLIS_MISSING_VAR"));
    }

    #[test]
    fn test_load_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        fs::write(
            &path,
            "gateway:\n  listen: \"127.0.0.1:8080\"\nupstream:\n  target: \"https://example.com\"\n",
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
