//! Pipeline and policy step definitions

use crate::{ConfigError, OneOrMany, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named predicate gating a policy step
///
/// Parameters other than `name` are kept verbatim and interpreted by the
/// condition implementation registered under that name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub name: String,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ConditionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// One `{condition, action}` entry under a policy name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
}

/// Pipeline definition as written in the configuration document
///
/// ```yaml
/// pipelines:
///   default:
///     apiEndpoints: [api]
///     policies:
///       - rate-limit:
///           - action: { max: 10 }
///       - proxy:
///           - action: { serviceEndpoint: backend }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub api_endpoints: OneOrMany<String>,

    #[serde(default)]
    pub policies: Vec<IndexMap<String, Option<OneOrMany<PolicyStepConfig>>>>,
}

/// A single policy step, flattened out of the document shape
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyInstanceConfig {
    pub policy: String,
    pub action: Value,
    pub condition: Option<ConditionConfig>,
}

impl PolicyInstanceConfig {
    pub fn new(policy: impl Into<String>, action: Value) -> Self {
        Self {
            policy: policy.into(),
            action,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: ConditionConfig) -> Self {
        self.condition = Some(condition);
        self
    }
}

impl PipelineConfig {
    pub fn endpoint_names(&self) -> Vec<String> {
        self.api_endpoints.to_vec()
    }

    /// Flatten the policy list into ordered instances
    ///
    /// Each list entry must name exactly one policy. A policy with no steps
    /// produces a single unconditional instance with empty action params.
    pub fn policy_instances(&self) -> Result<Vec<PolicyInstanceConfig>> {
        let mut instances = Vec::new();

        for (position, entry) in self.policies.iter().enumerate() {
            if entry.len() != 1 {
                return Err(ConfigError::Invalid(format!(
                    "policy entry #{} must name exactly one policy, found {}",
                    position,
                    entry.len()
                )));
            }

            for (policy, steps) in entry {
                let steps = steps.as_ref().map(OneOrMany::to_vec).unwrap_or_default();
                if steps.is_empty() {
                    instances.push(PolicyInstanceConfig::new(policy.clone(), empty_action()));
                    continue;
                }

                for step in steps {
                    instances.push(PolicyInstanceConfig {
                        policy: policy.clone(),
                        action: step.action.unwrap_or_else(empty_action),
                        condition: step.condition,
                    });
                }
            }
        }

        Ok(instances)
    }
}

fn empty_action() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_instances_preserve_order() {
        let pipeline: PipelineConfig = serde_yaml::from_str(
            r#"
apiEndpoints: api
policies:
  - log:
      - action: { message: "hello" }
  - terminate:
      - condition: { name: pathExact, path: /stop }
        action: { statusCode: 403 }
      - action: {}
  - proxy:
      action: { serviceEndpoint: backend }
"#,
        )
        .unwrap();

        let instances = pipeline.policy_instances().unwrap();
        let names: Vec<&str> = instances.iter().map(|i| i.policy.as_str()).collect();
        assert_eq!(names, vec!["log", "terminate", "terminate", "proxy"]);

        let condition = instances[1].condition.as_ref().unwrap();
        assert_eq!(condition.name, "pathExact");
        assert_eq!(condition.params.get("path"), Some(&json!("/stop")));
        assert_eq!(instances[3].action, json!({ "serviceEndpoint": "backend" }));
        assert_eq!(pipeline.endpoint_names(), vec!["api".to_string()]);
    }

    #[test]
    fn test_policy_without_steps() {
        let pipeline: PipelineConfig =
            serde_yaml::from_str("apiEndpoints: [a, b]\npolicies:\n  - terminate:\n").unwrap();
        let instances = pipeline.policy_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].action, json!({}));
        assert!(instances[0].condition.is_none());
    }

    #[test]
    fn test_policy_entry_with_two_names_is_rejected() {
        let pipeline: PipelineConfig = serde_yaml::from_str(
            "policies:\n  - log: { action: {} }\n    proxy: { action: {} }\n",
        )
        .unwrap();
        assert!(matches!(
            pipeline.policy_instances(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
