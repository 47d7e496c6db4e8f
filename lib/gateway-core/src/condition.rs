//! Condition evaluator: named boolean predicates gating policy steps
//!
//! Conditions are compiled from configuration once, when a pipeline is built,
//! and evaluated synchronously per request. Evaluation has no side effects
//! and never touches the network or storage.

use crate::context::RequestContext;
use crate::expression::Expression;
use crate::route::HostPattern;
use crate::{CoreError, Result};
use gateway_api::ConditionConfig;
use hyper::Method;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// A compiled predicate over a request
pub trait Condition: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, context: &RequestContext) -> bool;
}

/// Builds a condition from its configuration
///
/// The registry is passed in so combinators can compile nested conditions.
pub type ConditionFactory =
    Arc<dyn Fn(&ConditionConfig, &ConditionRegistry) -> Result<Arc<dyn Condition>> + Send + Sync>;

/// Registry of condition implementations by name
///
/// Populated once at startup, then shared read-only.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    factories: HashMap<String, ConditionFactory>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in condition
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("always", Arc::new(Constant::always));
        registry.register("never", Arc::new(Constant::never));
        registry.register("allOf", Arc::new(Combinator::all_of));
        registry.register("oneOf", Arc::new(Combinator::one_of));
        registry.register("not", Arc::new(Not::build));
        registry.register("pathExact", Arc::new(PathExact::build));
        registry.register("pathMatch", Arc::new(PathMatch::build));
        registry.register("method", Arc::new(MethodIs::build));
        registry.register("hostMatch", Arc::new(HostMatch::build));
        registry.register("expression", Arc::new(ExpressionCondition::build));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ConditionFactory) {
        let name = name.into();
        debug!("Registered condition: {}", name);
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Compile a condition; unknown names are configuration errors
    pub fn compile(&self, config: &ConditionConfig) -> Result<Arc<dyn Condition>> {
        let factory = self
            .factories
            .get(&config.name)
            .ok_or_else(|| CoreError::UnknownCondition(config.name.clone()))?;
        factory(config, self)
    }

    /// Compile and evaluate in one step
    pub fn evaluate(
        &self,
        name: &str,
        context: &RequestContext,
        config: &ConditionConfig,
    ) -> Result<bool> {
        let mut config = config.clone();
        config.name = name.to_string();
        Ok(self.compile(&config)?.evaluate(context))
    }
}

fn invalid(config: &ConditionConfig, reason: impl Into<String>) -> CoreError {
    CoreError::InvalidCondition {
        condition: config.name.clone(),
        reason: reason.into(),
    }
}

fn string_param(config: &ConditionConfig, key: &str) -> Result<String> {
    match config.params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(config, format!("{:?} must be a string", key))),
        None => Err(invalid(config, format!("missing {:?}", key))),
    }
}

fn nested(config: &ConditionConfig, value: &Value) -> Result<ConditionConfig> {
    serde_json::from_value(value.clone())
        .map_err(|e| invalid(config, format!("invalid nested condition: {}", e)))
}

struct Constant(&'static str, bool);

impl Constant {
    fn always(_: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        Ok(Arc::new(Self("always", true)))
    }

    fn never(_: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        Ok(Arc::new(Self("never", false)))
    }
}

impl Condition for Constant {
    fn name(&self) -> &'static str {
        self.0
    }

    fn evaluate(&self, _context: &RequestContext) -> bool {
        self.1
    }
}

/// `allOf` / `oneOf` over nested conditions
struct Combinator {
    name: &'static str,
    all: bool,
    conditions: Vec<Arc<dyn Condition>>,
}

impl Combinator {
    fn all_of(config: &ConditionConfig, registry: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        Self::build("allOf", config, registry)
    }

    fn one_of(config: &ConditionConfig, registry: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        Self::build("oneOf", config, registry)
    }

    fn build(
        name: &'static str,
        config: &ConditionConfig,
        registry: &ConditionRegistry,
    ) -> Result<Arc<dyn Condition>> {
        let list = match config.params.get("conditions") {
            Some(Value::Array(list)) if !list.is_empty() => list,
            _ => return Err(invalid(config, "\"conditions\" must be a non-empty list")),
        };
        let conditions = list
            .iter()
            .map(|v| registry.compile(&nested(config, v)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Self {
            name,
            all: name == "allOf",
            conditions,
        }))
    }
}

impl Condition for Combinator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        if self.all {
            self.conditions.iter().all(|c| c.evaluate(context))
        } else {
            self.conditions.iter().any(|c| c.evaluate(context))
        }
    }
}

struct Not(Arc<dyn Condition>);

impl Not {
    fn build(config: &ConditionConfig, registry: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        let inner = config
            .params
            .get("condition")
            .ok_or_else(|| invalid(config, "missing \"condition\""))?;
        Ok(Arc::new(Self(registry.compile(&nested(config, inner)?)?)))
    }
}

impl Condition for Not {
    fn name(&self) -> &'static str {
        "not"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        !self.0.evaluate(context)
    }
}

struct PathExact(String);

impl PathExact {
    fn build(config: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        Ok(Arc::new(Self(string_param(config, "path")?)))
    }
}

impl Condition for PathExact {
    fn name(&self) -> &'static str {
        "pathExact"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        context.path == self.0
    }
}

struct PathMatch(Regex);

impl PathMatch {
    fn build(config: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        let pattern = string_param(config, "pattern")?;
        let regex = Regex::new(&pattern).map_err(|e| CoreError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(Self(regex)))
    }
}

impl Condition for PathMatch {
    fn name(&self) -> &'static str {
        "pathMatch"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        self.0.is_match(&context.path)
    }
}

struct MethodIs(Vec<Method>);

impl MethodIs {
    fn build(config: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        let names: Vec<String> = match config.params.get("methods") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(list)) => list
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(config, "\"methods\" entries must be strings"))
                })
                .collect::<Result<_>>()?,
            _ => return Err(invalid(config, "\"methods\" must be a string or a list")),
        };
        let methods = names
            .iter()
            .map(|m| {
                Method::from_str(&m.to_ascii_uppercase())
                    .map_err(|_| invalid(config, format!("invalid method {:?}", m)))
            })
            .collect::<Result<_>>()?;
        Ok(Arc::new(Self(methods)))
    }
}

impl Condition for MethodIs {
    fn name(&self) -> &'static str {
        "method"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        self.0.contains(&context.method)
    }
}

struct HostMatch(HostPattern);

impl HostMatch {
    fn build(config: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        let pattern = string_param(config, "pattern")?;
        Ok(Arc::new(Self(HostPattern::parse(Some(&pattern))?)))
    }
}

impl Condition for HostMatch {
    fn name(&self) -> &'static str {
        "hostMatch"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        self.0.matches(context.hostname().as_deref())
    }
}

/// Truthiness of a sandboxed expression; evaluation failures count as false
struct ExpressionCondition(Expression);

impl ExpressionCondition {
    fn build(config: &ConditionConfig, _: &ConditionRegistry) -> Result<Arc<dyn Condition>> {
        let source = string_param(config, "expression")?;
        Ok(Arc::new(Self(Expression::parse(&source)?)))
    }
}

impl Condition for ExpressionCondition {
    fn name(&self) -> &'static str {
        "expression"
    }

    fn evaluate(&self, context: &RequestContext) -> bool {
        match self.0.evaluate_bool(context) {
            Ok(result) => result,
            Err(e) => {
                warn!(expression = %self.0, error = %e, "Condition expression failed to evaluate");
                false
            }
        }
    }
}
