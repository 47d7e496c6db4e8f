//! Built-in policies

pub mod cors;
pub mod expression;
pub mod headers;
pub mod log;
pub mod proxy;
pub mod rate_limit;
pub mod rewrite;
pub mod terminate;
pub mod throttle;
pub mod transformer;

use crate::policy::PolicyRegistry;
use std::sync::Arc;

pub(crate) fn register_builtins(registry: &mut PolicyRegistry) {
    registry.register("proxy", Arc::new(proxy::build));
    registry.register("terminate", Arc::new(terminate::build));
    registry.register("rate-limit", Arc::new(rate_limit::build));
    registry.register("throttle-group", Arc::new(throttle::build_group));
    registry.register("throttle", Arc::new(throttle::build));
    registry.register("headers", Arc::new(headers::build));
    registry.register("request-transformer", Arc::new(transformer::build_request));
    registry.register("response-transformer", Arc::new(transformer::build_response));
    registry.register("rewrite", Arc::new(rewrite::build));
    registry.register("expression", Arc::new(expression::build));
    registry.register("log", Arc::new(log::build));
    registry.register("cors", Arc::new(cors::build));
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::forwarder::RequestForwarder;
    use crate::metrics::GatewayMetrics;
    use crate::policy::{BuildContext, Flow, Policy, PolicyRegistry};
    use gateway_api::GatewayConfig;
    use gateway_core::{GatewayResponse, RequestContext};
    use hyper::body::Bytes;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::{HeaderMap, Method};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    /// Build a registered policy against a minimal configuration
    pub fn build(name: &str, action: Value) -> gateway_core::Result<Arc<dyn Policy>> {
        build_with(&GatewayConfig::default(), name, action)
    }

    pub fn build_with(
        config: &GatewayConfig,
        name: &str,
        action: Value,
    ) -> gateway_core::Result<Arc<dyn Policy>> {
        let forwarder = Arc::new(RequestForwarder::new(Duration::from_secs(1)));
        let metrics = GatewayMetrics::new().expect("metrics");
        let context = BuildContext {
            config,
            forwarder: &forwarder,
            metrics: &metrics,
        };
        PolicyRegistry::with_builtins().build(name, &action, &context)
    }

    pub fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> RequestContext {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        RequestContext::new(method, uri.parse().unwrap(), map, Bytes::from(body.to_string()))
    }

    pub fn get(uri: &str) -> RequestContext {
        request(Method::GET, uri, &[], "")
    }

    pub fn halted(flow: Flow) -> GatewayResponse {
        match flow {
            Flow::Halt(response) => response,
            Flow::Continue => panic!("expected the policy to halt"),
        }
    }

    pub fn body_text(response: &GatewayResponse) -> &str {
        std::str::from_utf8(&response.body).unwrap()
    }
}
