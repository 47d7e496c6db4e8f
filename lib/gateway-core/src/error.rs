use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building pipelines from configuration
///
/// Any of these aborts activation of the configuration version being built.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid match pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown API endpoint {endpoint:?} referenced by pipeline {pipeline:?}")]
    UnknownApiEndpoint { pipeline: String, endpoint: String },

    #[error("Unknown condition: {0}")]
    UnknownCondition(String),

    #[error("Invalid parameters for condition {condition:?}: {reason}")]
    InvalidCondition { condition: String, reason: String },

    #[error("Policy {0:?} is not registered")]
    UnknownPolicy(String),

    #[error("Policy {0:?} is not enabled in the policies whitelist")]
    PolicyNotEnabled(String),

    #[error("Invalid parameters for policy {policy:?}: {reason}")]
    InvalidPolicyParams { policy: String, reason: String },

    #[error("Invalid expression: {0}")]
    Expression(#[from] EvalError),

    #[error(transparent)]
    Config(#[from] gateway_api::ConfigError),
}

/// Typed failure of expression or template evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Cannot read property {property:?} of null ({target})")]
    UndefinedProperty { property: String, target: String },

    #[error("Invalid operands for {op}: {lhs} and {rhs}")]
    InvalidOperands {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
}

impl EvalError {
    /// Shift a syntax error position by `by` bytes
    pub(crate) fn offset(self, by: usize) -> Self {
        match self {
            EvalError::Syntax { position, message } => EvalError::Syntax {
                position: position + by,
                message,
            },
            other => other,
        }
    }
}
