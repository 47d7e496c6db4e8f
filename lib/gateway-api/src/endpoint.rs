//! API (inbound) and service (backend) endpoint definitions

use serde::{Deserialize, Serialize};

/// A value that may be written either as a scalar or as a list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

/// Inbound match rule for a named API endpoint
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpointConfig {
    /// Host to match: `*`, `*.example.com` or an exact host name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Express-style path patterns (`/users/:id`, `/api/*`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<OneOrMany<String>>,

    /// Raw regular expression matched against the whole path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,

    /// HTTP methods; empty matches all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<OneOrMany<String>>,
}

impl ApiEndpointConfig {
    /// Configured path patterns, `*` when none were given
    pub fn path_patterns(&self) -> Vec<String> {
        match &self.paths {
            Some(paths) => {
                let paths = paths.to_vec();
                if paths.is_empty() {
                    vec!["*".to_string()]
                } else {
                    paths
                }
            }
            None => vec!["*".to_string()],
        }
    }

    pub fn method_list(&self) -> Vec<String> {
        self.methods.as_ref().map(OneOrMany::to_vec).unwrap_or_default()
    }
}

/// Named backend target set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpointConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Load balancing strategy: `round-robin` or `static`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl ServiceEndpointConfig {
    /// All target URLs, `url` first
    pub fn targets(&self) -> Vec<String> {
        self.url
            .iter()
            .chain(self.urls.iter())
            .cloned()
            .collect()
    }
}
