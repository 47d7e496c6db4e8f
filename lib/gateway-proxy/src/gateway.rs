//! The request handler: resolve, run the chain, answer

use crate::access_log::AccessRecord;
use crate::chain::{ChainExecutor, ChainOutcome, Pipeline};
use crate::forwarder::RequestForwarder;
use crate::metrics::GatewayMetrics;
use crate::policy::{BuildContext, PolicyRegistry};
use arc_swap::ArcSwap;
use gateway_api::GatewayConfig;
use gateway_core::{
    compile_api_endpoints, pipeline_endpoints, ConditionRegistry, GatewayResponse, PipelineResolver,
    RequestContext, RequestTarget,
};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for backend connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request body buffered before answering 413
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Process-lifetime pieces shared by every configuration version
pub struct GatewayComponents {
    pub policies: PolicyRegistry,
    pub conditions: ConditionRegistry,
    pub forwarder: Arc<RequestForwarder>,
    pub metrics: GatewayMetrics,
    pub executor: ChainExecutor,
    pub max_body_bytes: usize,
}

impl GatewayComponents {
    /// Built-in policies and conditions, a fresh metrics registry
    pub fn new(policy_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            policies: PolicyRegistry::with_builtins(),
            conditions: ConditionRegistry::with_builtins(),
            forwarder: Arc::new(RequestForwarder::new(DEFAULT_CONNECT_TIMEOUT)),
            metrics: GatewayMetrics::new()?,
            executor: ChainExecutor::new(policy_timeout),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }
}

/// One activated configuration version
pub struct Gateway {
    resolver: PipelineResolver<Pipeline>,
    executor: ChainExecutor,
    metrics: GatewayMetrics,
    metrics_path: Option<String>,
}

impl Gateway {
    /// Compile endpoints and build every pipeline of `config`
    ///
    /// Nothing is activated unless every pipeline builds.
    pub fn build(config: &GatewayConfig, components: &GatewayComponents) -> gateway_core::Result<Self> {
        let endpoints = compile_api_endpoints(config)?;
        let build_context = BuildContext {
            config,
            forwarder: &components.forwarder,
            metrics: &components.metrics,
        };

        let mut resolver = PipelineResolver::new();
        for (name, pipeline_config) in &config.pipelines {
            let matchers = pipeline_endpoints(name, pipeline_config, &endpoints)?;
            let pipeline = Pipeline::build(
                name,
                pipeline_config,
                &components.policies,
                &components.conditions,
                &build_context,
            )?;
            resolver.register(name.clone(), matchers, pipeline);
        }

        info!(
            "Gateway configured with {} pipelines over {} api endpoints",
            resolver.len(),
            endpoints.len()
        );

        Ok(Self {
            resolver,
            executor: components.executor.clone(),
            metrics: components.metrics.clone(),
            metrics_path: config.metrics.enabled.then(|| config.metrics.path.clone()),
        })
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.resolver.pipelines().map(|(name, _)| name).collect()
    }

    /// Handle one buffered request
    pub async fn handle(&self, mut context: RequestContext) -> GatewayResponse {
        if context.method == Method::GET && self.metrics_path.as_deref() == Some(context.path.as_str()) {
            return self.metrics_response();
        }

        let hostname = context.hostname();
        let resolved = self.resolver.resolve(&RequestTarget {
            host: Some(hostname.as_deref().unwrap_or("")),
            method: Some(&context.method),
            path: &context.path,
        });

        let (pipeline_name, response) = match resolved {
            None => {
                debug!("No pipeline matched {} {}", context.method, context.path);
                (None, GatewayResponse::not_found())
            }
            Some(resolved) => {
                context.params = resolved.params;
                context.api_endpoint = Some(resolved.api_endpoint.to_string());
                context.route_prefix = resolved.route_prefix.to_string();
                context.pipeline = Some(resolved.pipeline_name.to_string());

                let response = match self.executor.execute(resolved.pipeline, &mut context).await {
                    ChainOutcome::Halted { policy, response } => {
                        self.metrics.observe_halt(policy);
                        response
                    }
                    ChainOutcome::FellThrough => {
                        debug!("Pipeline {} completed without a response", resolved.pipeline_name);
                        GatewayResponse::not_found()
                    }
                    ChainOutcome::Failed { .. } => GatewayResponse::internal_error(),
                };
                (Some(resolved.pipeline_name), response)
            }
        };

        let record = AccessRecord::new(&context, &response);
        record.emit();
        self.metrics
            .observe_request(pipeline_name, record.status, record.response_time);

        response
    }

    fn metrics_response(&self) -> GatewayResponse {
        match self.metrics.gather() {
            Ok(text) => GatewayResponse::text(StatusCode::OK, text).with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            ),
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                GatewayResponse::internal_error()
            }
        }
    }
}

/// The active gateway, swapped atomically on reload
pub struct SharedGateway {
    active: ArcSwap<Gateway>,
    components: GatewayComponents,
}

impl SharedGateway {
    pub fn new(config: &GatewayConfig, components: GatewayComponents) -> gateway_core::Result<Self> {
        let gateway = Gateway::build(config, &components)?;
        Ok(Self {
            active: ArcSwap::from_pointee(gateway),
            components,
        })
    }

    /// Snapshot of the active version; in-flight requests keep theirs
    pub fn current(&self) -> Arc<Gateway> {
        self.active.load_full()
    }

    /// Build `config` and activate it; on error the current version stays
    pub fn reload(&self, config: &GatewayConfig) -> gateway_core::Result<()> {
        let gateway = Gateway::build(config, &self.components)?;
        self.active.store(Arc::new(gateway));
        info!("Gateway configuration reloaded");
        Ok(())
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.components.metrics
    }

    /// hyper entry point: buffer the body and run the active gateway
    pub async fn serve<B>(
        &self,
        request: Request<B>,
        remote_addr: SocketAddr,
        protocol: &'static str,
    ) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, self.components.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                debug!(
                    "Request body from {} exceeds {} bytes",
                    remote_addr, self.components.max_body_bytes
                );
                return Ok(
                    GatewayResponse::text(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large").into_hyper(),
                );
            }
            Err(e) => {
                debug!("Failed to read request body from {}: {}", remote_addr, e);
                return Ok(GatewayResponse::text(StatusCode::BAD_REQUEST, "Bad request").into_hyper());
            }
        };

        let context = RequestContext::new(parts.method, parts.uri, parts.headers, body)
            .with_remote_addr(remote_addr)
            .with_protocol(protocol);

        let gateway = self.current();
        Ok(gateway.handle(context).await.into_hyper())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;

    const CONFIG: &str = r#"
apiEndpoints:
  api:
    paths: ["/api/*"]
policies: [terminate, expression]
pipelines:
  api:
    apiEndpoints: [api]
    policies:
      - terminate:
          - condition: {name: pathExact, path: /api/blocked}
            action: {statusCode: 403, message: blocked}
      - expression:
          - action: {set: {seen: "true"}}
"#;

    fn components() -> GatewayComponents {
        GatewayComponents::new(Duration::from_secs(5)).unwrap()
    }

    fn get(path: &str) -> RequestContext {
        RequestContext::new(Method::GET, path.parse().unwrap(), HeaderMap::new(), Bytes::new())
    }

    #[tokio::test]
    async fn test_routing_outcomes() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let gateway = Gateway::build(&config, &components()).unwrap();
        assert_eq!(gateway.pipeline_names(), vec!["api"]);

        let blocked = gateway.handle(get("/api/blocked")).await;
        assert_eq!(blocked.status, StatusCode::FORBIDDEN);
        assert_eq!(blocked.body, Bytes::from_static(b"blocked"));

        let fell_through = gateway.handle(get("/api/other")).await;
        assert_eq!(fell_through.status, StatusCode::NOT_FOUND);

        let unmatched = gateway.handle(get("/elsewhere")).await;
        assert_eq!(unmatched.status, StatusCode::NOT_FOUND);
        assert_eq!(unmatched.body, Bytes::from_static(b"Not found"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let gateway = Gateway::build(&config, &components()).unwrap();
        gateway.handle(get("/api/blocked")).await;

        let response = gateway.handle(get("/metrics")).await;
        assert_eq!(response.status, StatusCode::OK);
        let text = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(text.contains("gateway_requests_total{pipeline=\"api\",status=\"403\"} 1"));
        assert!(text.contains("gateway_policy_halts_total{policy=\"terminate\"} 1"));
    }

    #[test]
    fn test_disabled_policy_fails_build() {
        let config = GatewayConfig::from_yaml_str(&CONFIG.replace("policies: [terminate, expression]", "policies: [terminate]")).unwrap();
        assert!(matches!(
            Gateway::build(&config, &components()),
            Err(gateway_core::CoreError::PolicyNotEnabled(name)) if name == "expression"
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let mut components = components();
        components.max_body_bytes = 16;
        let shared = SharedGateway::new(&config, components).unwrap();
        let remote: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let request = |size: usize| {
            Request::builder()
                .method(Method::POST)
                .uri("/api/blocked")
                .body(Full::new(Bytes::from(vec![b'x'; size])))
                .unwrap()
        };

        let rejected = shared.serve(request(32), remote, "http").await.unwrap();
        assert_eq!(rejected.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let accepted = shared.serve(request(16), remote, "http").await.unwrap();
        assert_eq!(accepted.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_reload_keeps_old_version_on_error() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let shared = SharedGateway::new(&config, components()).unwrap();

        let broken = GatewayConfig::from_yaml_str(
            r#"
pipelines:
  api:
    apiEndpoints: [missing]
    policies: []
"#,
        )
        .unwrap();
        assert!(shared.reload(&broken).is_err());
        assert_eq!(shared.current().pipeline_names(), vec!["api"]);

        let replacement = GatewayConfig::from_yaml_str(
            r#"
apiEndpoints:
  all: {}
policies: [terminate]
pipelines:
  everything:
    apiEndpoints: [all]
    policies:
      - terminate:
          - action: {statusCode: 418}
"#,
        )
        .unwrap();
        let before = shared.current();
        shared.reload(&replacement).unwrap();
        assert_eq!(shared.current().pipeline_names(), vec!["everything"]);
        assert_eq!(before.pipeline_names(), vec!["api"]);
        assert_eq!(shared.current().handle(get("/x")).await.status, StatusCode::IM_A_TEAPOT);
    }
}
