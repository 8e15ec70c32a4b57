use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

use crate::sidecar::DEFAULT_IMAGE;

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_cpu_request() -> String {
    "30m".to_string()
}

fn default_memory_request() -> String {
    "100Mi".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlbeeConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Bounds the wait for request headers, including between requests on a
    /// kept-alive connection.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub mutation: MutationOptions,
}

/// Process-wide injection defaults. Per-resource annotations take precedence
/// over every field except `require_annotation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationOptions {
    #[serde(default)]
    pub default_instance: String,
    #[serde(default)]
    pub default_secret_name: String,
    #[serde(default)]
    pub default_ca_config_map: String,
    /// Only inject when the inject annotation is exactly `"true"`.
    #[serde(default)]
    pub require_annotation: bool,
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default = "default_cpu_request")]
    pub cpu_request: String,
    #[serde(default = "default_memory_request")]
    pub memory_request: String,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            default_instance: String::new(),
            default_secret_name: String::new(),
            default_ca_config_map: String::new(),
            require_annotation: false,
            default_image: default_image(),
            cpu_request: default_cpu_request(),
            memory_request: default_memory_request(),
        }
    }
}

impl SqlbeeConfig {
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed("SQLBEE_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, Box<figment::Error>> {
        figment.extract().map_err(Box::new)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SqlbeeConfig::from_figment(Figment::from(Yaml::string("{}"))).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8443");
        assert_eq!(config.health_addr, "0.0.0.0:8080");
        assert_eq!(config.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(15));
        assert!(!config.mutation.require_annotation);
        assert!(config.mutation.default_instance.is_empty());
        assert_eq!(config.mutation.default_image, DEFAULT_IMAGE);
        assert_eq!(config.mutation.cpu_request, "30m");
        assert_eq!(config.mutation.memory_request, "100Mi");
    }

    #[test]
    fn test_mutation_section_overrides() {
        let yaml = r#"
tls_cert_path: /tls/tls.crt
idle_timeout_secs: 30
mutation:
  default_instance: "proj:region:instance"
  default_secret_name: cloud-sql-credentials
  require_annotation: true
  cpu_request: 10m
"#;
        let config = SqlbeeConfig::from_figment(Figment::from(Yaml::string(yaml))).unwrap();

        assert_eq!(config.tls_cert_path, "/tls/tls.crt");
        assert_eq!(config.tls_key_path, "/certs/tls.key");
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.mutation.default_instance, "proj:region:instance");
        assert_eq!(config.mutation.default_secret_name, "cloud-sql-credentials");
        assert!(config.mutation.require_annotation);
        assert_eq!(config.mutation.cpu_request, "10m");
        assert_eq!(config.mutation.memory_request, "100Mi");
    }

    #[test]
    fn test_invalid_type_is_rejected() {
        let result = SqlbeeConfig::from_figment(Figment::from(Yaml::string(
            "read_timeout_secs: soon",
        )));
        assert!(result.is_err());
    }
}
