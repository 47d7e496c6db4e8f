use crate::forwarder::{ForwardOptions, RequestForwarder};
use crate::load_balancer::{build_strategy, LoadBalancingStrategy};
use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{GatewayResponse, RequestContext};
use prometheus::IntCounter;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyParams {
    service_endpoint: String,
    strategy: Option<String>,
    #[serde(default = "enabled")]
    change_origin: bool,
    #[serde(default)]
    strip_path: bool,
    #[serde(default = "default_timeout_ms")]
    proxy_timeout: u64,
}

fn enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Forwards the request to a service endpoint and halts with its response
pub struct ProxyPolicy {
    service_endpoint: String,
    strategy: Arc<dyn LoadBalancingStrategy>,
    forwarder: Arc<RequestForwarder>,
    options: ForwardOptions,
    upstream_failures: IntCounter,
}

pub fn build(action: &Value, context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: ProxyParams = parse_params("proxy", action)?;
    let endpoint = context
        .config
        .service_endpoint(&params.service_endpoint)
        .ok_or_else(|| {
            invalid_params(
                "proxy",
                format!("unknown serviceEndpoint {:?}", params.service_endpoint),
            )
        })?;
    if params.proxy_timeout == 0 {
        return Err(invalid_params("proxy", "proxyTimeout must be greater than 0"));
    }

    let strategy = build_strategy(endpoint, params.strategy.as_deref())?;
    debug!(
        "Proxy to {} using {} over {} target(s)",
        params.service_endpoint,
        strategy.name(),
        strategy.targets().len()
    );

    Ok(Arc::new(ProxyPolicy {
        service_endpoint: params.service_endpoint,
        strategy,
        forwarder: context.forwarder.clone(),
        options: ForwardOptions {
            change_origin: params.change_origin,
            strip_path: params.strip_path,
            timeout: Duration::from_millis(params.proxy_timeout),
        },
        upstream_failures: context.metrics.upstream_failures_total.clone(),
    }))
}

#[async_trait::async_trait]
impl Policy for ProxyPolicy {
    fn name(&self) -> &'static str {
        "proxy"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        let target = self.strategy.next_target();
        context.target = Some(target.url().to_string());

        match self.forwarder.forward(target, context, &self.options).await {
            Ok(mut response) => {
                context.apply_response_hooks(&mut response);
                Ok(Flow::Halt(response))
            }
            Err(e) => {
                warn!(
                    service_endpoint = %self.service_endpoint,
                    target = %target,
                    "Upstream failure: {}",
                    e
                );
                self.upstream_failures.inc();
                Ok(Flow::Halt(GatewayResponse::bad_gateway()))
            }
        }
    }
}
