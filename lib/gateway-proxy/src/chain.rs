//! Pipelines and the policy chain executor

use crate::policy::{BuildContext, Flow, Policy, PolicyError, PolicyRegistry};
use gateway_api::PipelineConfig;
use gateway_core::{Condition, ConditionRegistry, CoreError, GatewayResponse, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, error, span, Instrument, Level};

/// Default bound on a single policy invocation
pub const DEFAULT_POLICY_TIMEOUT: Duration = Duration::from_secs(60);

/// A policy instance plus the condition gating it
pub struct PolicyStep {
    policy: Arc<dyn Policy>,
    condition: Option<Arc<dyn Condition>>,
}

impl PolicyStep {
    pub fn new(policy: Arc<dyn Policy>) -> Self {
        Self {
            policy,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}

/// Ordered policy chain of one configured pipeline
pub struct Pipeline {
    name: String,
    steps: Vec<PolicyStep>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<PolicyStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Build every policy instance of `config`
    ///
    /// Unregistered or non-whitelisted policies, unknown conditions and bad
    /// action parameters all fail the build.
    pub fn build(
        name: &str,
        config: &PipelineConfig,
        policies: &PolicyRegistry,
        conditions: &ConditionRegistry,
        context: &BuildContext<'_>,
    ) -> gateway_core::Result<Self> {
        let mut steps = Vec::new();

        for instance in config.policy_instances()? {
            if !policies.contains(&instance.policy) {
                return Err(CoreError::UnknownPolicy(instance.policy));
            }
            if !context.config.is_policy_enabled(&instance.policy) {
                return Err(CoreError::PolicyNotEnabled(instance.policy));
            }

            let policy = policies.build(&instance.policy, &instance.action, context)?;
            let mut step = PolicyStep::new(policy);
            if let Some(condition) = &instance.condition {
                step = step.with_condition(conditions.compile(condition)?);
            }
            steps.push(step);
        }

        debug!("Built pipeline {} with {} policies", name, steps.len());
        Ok(Self::new(name, steps))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PolicyStep] {
        &self.steps
    }
}

/// Terminal state of a chain run
#[derive(Debug)]
pub enum ChainOutcome {
    /// A policy wrote a response
    Halted {
        policy: &'static str,
        response: GatewayResponse,
    },
    /// Every policy continued and none wrote a response
    FellThrough,
    /// A policy failed or never produced an outcome
    Failed {
        policy: &'static str,
        error: PolicyError,
    },
}

/// Runs pipelines strictly in configured order
#[derive(Clone, Debug)]
pub struct ChainExecutor {
    policy_timeout: Duration,
}

impl ChainExecutor {
    pub fn new(policy_timeout: Duration) -> Self {
        Self { policy_timeout }
    }

    pub fn policy_timeout(&self) -> Duration {
        self.policy_timeout
    }

    /// Run `pipeline` against `context`
    ///
    /// Dropping the returned future abandons the remaining policies.
    pub async fn execute(&self, pipeline: &Pipeline, context: &mut RequestContext) -> ChainOutcome {
        for (position, step) in pipeline.steps.iter().enumerate() {
            let name = step.policy.name();

            if let Some(condition) = &step.condition {
                if !condition.evaluate(context) {
                    debug!("Skipping policy {} at {}: condition {} is false", name, position, condition.name());
                    continue;
                }
            }

            let span = span!(Level::DEBUG, "policy", name = name, position = position);
            let result = tokio_timeout(self.policy_timeout, step.policy.handle(context))
                .instrument(span)
                .await;

            match result {
                Ok(Ok(Flow::Continue)) => {
                    debug!("Policy {} continued", name);
                }
                Ok(Ok(Flow::Halt(response))) => {
                    debug!("Policy {} halted with status {}", name, response.status);
                    return ChainOutcome::Halted {
                        policy: name,
                        response,
                    };
                }
                Ok(Err(error)) => {
                    error!(policy = name, pipeline = pipeline.name(), "Policy failed: {}", error);
                    return ChainOutcome::Failed { policy: name, error };
                }
                Err(_) => {
                    let error = PolicyError::ExecutorDefect {
                        policy: name,
                        timeout: self.policy_timeout,
                    };
                    error!(policy = name, pipeline = pipeline.name(), "{}", error);
                    return ChainOutcome::Failed { policy: name, error };
                }
            }
        }

        ChainOutcome::FellThrough
    }
}

impl Default for ChainExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_POLICY_TIMEOUT)
    }
}
