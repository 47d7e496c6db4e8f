//! Policy chains, built-in policies and backend forwarding
pub mod access_log;
pub mod chain;
pub mod forwarder;
pub mod gateway;
pub mod limiter;
pub mod load_balancer;
pub mod metrics;
pub mod policies;
pub mod policy;
pub mod tls;

pub use access_log::AccessRecord;
pub use chain::{ChainExecutor, ChainOutcome, Pipeline, PolicyStep, DEFAULT_POLICY_TIMEOUT};
pub use forwarder::{ForwardOptions, RequestForwarder, UpstreamError};
pub use gateway::{Gateway, GatewayComponents, SharedGateway};
pub use limiter::{GroupThrottle, WindowHit, WindowLimiter};
pub use load_balancer::{build_strategy, LoadBalancingStrategy, RoundRobin, ServiceTarget, Static};
pub use metrics::GatewayMetrics;
pub use policy::{BuildContext, Flow, Policy, PolicyError, PolicyFactory, PolicyRegistry};
pub use tls::{server_config_from_pem, tls_acceptor};
