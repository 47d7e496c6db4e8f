//! Gateway core: request context, expressions, conditions and routing
//!
//! Everything here is transport-agnostic. The proxy crate builds policy
//! chains on top of these pieces:
//! - RequestContext: per-request state visible to policies and expressions
//! - Expression / Template: the sandboxed expression language
//! - ConditionRegistry: named predicates gating policy steps
//! - PipelineResolver: maps a request to the pipeline serving it

pub mod condition;
pub mod context;
pub mod error;
pub mod expression;
pub mod resolver;
pub mod response;
pub mod route;

pub use condition::{Condition, ConditionFactory, ConditionRegistry};
pub use context::{parse_query, RequestContext, ResponseHook};
pub use error::{CoreError, EvalError, Result};
pub use expression::{render, truthy, Expression, Scope, Template};
pub use resolver::{
    compile_api_endpoints, pipeline_endpoints, PipelineResolver, RequestTarget, Resolved,
};
pub use response::{
    GatewayResponse, BAD_GATEWAY_MESSAGE, INTERNAL_ERROR_MESSAGE, NOT_FOUND_MESSAGE,
};
pub use route::{HostPattern, PathPattern, RouteMatcher};
