//! Policy capability and the name-to-factory registry

use crate::forwarder::RequestForwarder;
use crate::metrics::GatewayMetrics;
use gateway_api::GatewayConfig;
use gateway_core::{CoreError, EvalError, GatewayResponse, RequestContext};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Outcome of a policy that did not fail
#[derive(Debug)]
pub enum Flow {
    /// Hand the request to the next policy in the chain
    Continue,
    /// Stop the chain and write this response
    Halt(GatewayResponse),
}

/// Per-request policy failure; the chain answers with a generic 500
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Expression evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error("Invalid request body: {0}")]
    Body(String),

    #[error("Policy {policy:?} produced no outcome within {timeout:?}")]
    ExecutorDefect { policy: &'static str, timeout: Duration },

    #[error("Internal policy error: {0}")]
    Internal(String),
}

/// A configured unit of request processing
///
/// Implementations are built once per configuration version and shared by
/// every request through that pipeline, so any state they hold must be
/// safe for concurrent use.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError>;
}

/// Everything a policy factory may consult while building
pub struct BuildContext<'a> {
    pub config: &'a GatewayConfig,
    pub forwarder: &'a Arc<RequestForwarder>,
    pub metrics: &'a GatewayMetrics,
}

pub type PolicyFactory = Arc<
    dyn Fn(&Value, &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> + Send + Sync,
>;

/// Registry of policy implementations by name
///
/// Filled at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    factories: HashMap<String, PolicyFactory>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::policies::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PolicyFactory) {
        let name = name.into();
        debug!("Registered policy: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build one policy instance from its action parameters
    pub fn build(
        &self,
        name: &str,
        action: &Value,
        context: &BuildContext<'_>,
    ) -> gateway_core::Result<Arc<dyn Policy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CoreError::UnknownPolicy(name.to_string()))?;
        factory(action, context)
    }
}

/// Deserialize action parameters, treating a missing action as `{}`
pub fn parse_params<T: DeserializeOwned>(policy: &str, action: &Value) -> gateway_core::Result<T> {
    let action = match action {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(action).map_err(|e| invalid_params(policy, e.to_string()))
}

pub fn invalid_params(policy: &str, reason: impl Into<String>) -> CoreError {
    CoreError::InvalidPolicyParams {
        policy: policy.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(default = "default_code")]
        status_code: u16,
    }

    fn default_code() -> u16 {
        400
    }

    #[test]
    fn test_parse_params_defaults() {
        let sample: Sample = parse_params("sample", &Value::Null).unwrap();
        assert_eq!(sample.status_code, 400);
        let sample: Sample = parse_params("sample", &json!({"statusCode": 418})).unwrap();
        assert_eq!(sample.status_code, 418);
    }

    #[test]
    fn test_parse_params_error_names_policy() {
        let err = parse_params::<Sample>("sample", &json!({"statusCode": "x"})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPolicyParams { ref policy, .. } if policy == "sample"));
    }

    #[test]
    fn test_registry_builtins() {
        let registry = PolicyRegistry::with_builtins();
        for name in [
            "proxy",
            "terminate",
            "rate-limit",
            "throttle-group",
            "throttle",
            "headers",
            "request-transformer",
            "response-transformer",
            "rewrite",
            "expression",
            "log",
            "cors",
        ] {
            assert!(registry.contains(name), "{} should be registered", name);
        }
        assert!(!registry.contains("basic-auth"));
    }
}
