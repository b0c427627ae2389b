//! Configuration types for the decoy server.

use crate::cors::CorsPolicy;
use crate::model::Expectation;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Reply 200 to CORS preflights that target the mock surface.
    #[serde(default)]
    pub enable_cors_for_api: bool,

    /// Attach CORS headers to every response and accept any preflight.
    #[serde(default)]
    pub enable_cors_for_all_responses: bool,

    /// Timeout for explicit proxy forwards, in milliseconds. Exploratory
    /// forwards use a hard-coded 1000 ms budget instead.
    #[serde(default = "default_socket_connection_timeout_ms")]
    pub socket_connection_timeout_ms: u64,

    /// Run as a forward proxy: relay every unmatched request.
    #[serde(default)]
    pub explicit_proxy: bool,

    /// Additional `Host` values treated as this server itself.
    #[serde(default)]
    pub local_addresses: Vec<String>,

    /// Upstream proxy every outbound forward is sent through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_proxy: Option<UpstreamProxyConfig>,

    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    /// Expectations installed at boot.
    #[serde(default)]
    pub expectations: Vec<Expectation>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            enable_cors_for_api: false,
            enable_cors_for_all_responses: false,
            socket_connection_timeout_ms: default_socket_connection_timeout_ms(),
            explicit_proxy: false,
            local_addresses: Vec::new(),
            upstream_proxy: None,
            connection_pool: ConnectionPoolConfig::default(),
            expectations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UpstreamProxyConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `user:password` pair when both halves are configured.
    pub fn basic_credentials(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some(format!("{user}:{password}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    2080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_socket_connection_timeout_ms() -> u64 {
    10_000
}

fn default_max_idle_per_host() -> usize {
    32
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_keepalive_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.socket_connection_timeout_ms == 0 {
            anyhow::bail!("socket_connection_timeout_ms must be greater than zero");
        }
        if let Some(proxy) = &self.upstream_proxy {
            if proxy.host.is_empty() {
                anyhow::bail!("upstream_proxy.host must not be empty");
            }
        }
        let mut seen = HashSet::new();
        for expectation in &self.expectations {
            if expectation.id.is_empty() {
                anyhow::bail!("expectation ids must not be empty");
            }
            if !seen.insert(expectation.id.as_str()) {
                anyhow::bail!("duplicate expectation id '{}'", expectation.id);
            }
        }
        Ok(())
    }

    pub fn socket_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_connection_timeout_ms)
    }

    pub fn cors_policy(&self) -> CorsPolicy {
        CorsPolicy {
            for_api: self.enable_cors_for_api,
            for_all_responses: self.enable_cors_for_all_responses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.listen.port, 2080);
        assert_eq!(config.socket_connection_timeout_ms, 10_000);
        assert!(!config.explicit_proxy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_yaml_parses_with_defaults() {
        let config: Config = serde_yaml::from_str("listen:\n  port: 9001\n").unwrap();
        assert_eq!(config.listen.port, 9001);
        assert_eq!(config.connection_pool.max_idle_per_host, 32);
    }

    #[test]
    fn test_expectations_parse_from_yaml() {
        let yaml = r#"
expectations:
  - id: greet
    match:
      method: GET
      path: /greet
    action:
      type: respond
      response:
        status: 200
        body: hello
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.expectations.len(), 1);
        assert_eq!(config.expectations[0].id, "greet");
    }

    #[test]
    fn test_duplicate_expectation_ids_rejected() {
        let yaml = r#"
expectations:
  - id: same
    action:
      type: respond
      response:
        status: 200
  - id: same
    action:
      type: respond
      response:
        status: 201
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config {
            socket_connection_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proxy_credentials_require_both_halves() {
        let mut proxy = UpstreamProxyConfig {
            host: "proxy.internal".into(),
            port: 3128,
            username: Some("u".into()),
            password: None,
        };
        assert!(proxy.basic_credentials().is_none());
        proxy.password = Some("p".into());
        assert_eq!(proxy.basic_credentials().as_deref(), Some("u:p"));
        assert_eq!(proxy.address(), "proxy.internal:3128");
    }
}
