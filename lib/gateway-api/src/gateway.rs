//! Top-level gateway configuration document

use crate::{ApiEndpointConfig, ConfigError, PipelineConfig, Result, ServiceEndpointConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Plain HTTP listener
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

/// HTTPS listener; only started when `tls` is present
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_https_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFilesConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFilesConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// The whole gateway configuration
///
/// Maps keep document order: pipelines are matched in the order they are
/// declared here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpListenerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpsListenerConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub api_endpoints: IndexMap<String, ApiEndpointConfig>,

    #[serde(default)]
    pub service_endpoints: IndexMap<String, ServiceEndpointConfig>,

    #[serde(default)]
    pub private_endpoints: IndexMap<String, ServiceEndpointConfig>,

    /// Enabled-policy whitelist
    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineConfig>,
}

impl GatewayConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a configuration file, choosing the format from its extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        debug!("Loading gateway configuration from {}", path.display());

        match extension.as_str() {
            "yml" | "yaml" => Self::from_yaml_str(&text),
            "json" => Self::from_json_str(&text),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Look up a backend by name in service endpoints, then private endpoints
    pub fn service_endpoint(&self, name: &str) -> Option<&ServiceEndpointConfig> {
        self.service_endpoints
            .get(name)
            .or_else(|| self.private_endpoints.get(name))
    }

    pub fn is_policy_enabled(&self, name: &str) -> bool {
        self.policies.iter().any(|p| p == name)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
