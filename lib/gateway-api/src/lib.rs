//! Gateway configuration model
//!
//! This library defines the declarative configuration consumed by the gateway:
//! - ApiEndpoint: inbound host/path/method match rules
//! - ServiceEndpoint: named backend target sets and their balancing strategy
//! - Pipeline: ordered policy chains bound to one or more API endpoints
//! - GatewayConfig: the whole document, including the enabled-policy whitelist

pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod pipeline;

pub use endpoint::{ApiEndpointConfig, OneOrMany, ServiceEndpointConfig};
pub use error::{ConfigError, Result};
pub use gateway::{GatewayConfig, HttpListenerConfig, HttpsListenerConfig, MetricsConfig, TlsFilesConfig};
pub use pipeline::{ConditionConfig, PipelineConfig, PolicyInstanceConfig, PolicyStepConfig};
