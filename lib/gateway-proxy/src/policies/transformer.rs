use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{render, Expression, GatewayResponse, RequestContext, ResponseHook};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Deserialize, Default)]
struct Operations {
    #[serde(default)]
    add: IndexMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Deserialize)]
struct TransformerParams {
    #[serde(default)]
    headers: Operations,
    #[serde(default)]
    body: Operations,
}

/// Header and JSON body edits compiled from `{headers, body}` parameters
struct Transform {
    add_headers: Vec<(HeaderName, Expression)>,
    remove_headers: Vec<HeaderName>,
    add_fields: Vec<(String, Expression)>,
    remove_fields: Vec<String>,
}

impl Transform {
    fn build(policy: &str, action: &Value) -> gateway_core::Result<Self> {
        let params: TransformerParams = parse_params(policy, action)?;
        let header = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid_params(policy, format!("invalid header name {:?}", name)))
        };
        let expression = |source: &str| {
            Expression::parse(source).map_err(|e| invalid_params(policy, format!("{:?}: {}", source, e)))
        };

        Ok(Self {
            add_headers: params
                .headers
                .add
                .iter()
                .map(|(name, source)| Ok((header(name.as_str())?, expression(source.as_str())?)))
                .collect::<gateway_core::Result<_>>()?,
            remove_headers: params
                .headers
                .remove
                .iter()
                .map(|name| header(name.as_str()))
                .collect::<gateway_core::Result<_>>()?,
            add_fields: params
                .body
                .add
                .iter()
                .map(|(field, source)| Ok((field.clone(), expression(source.as_str())?)))
                .collect::<gateway_core::Result<_>>()?,
            remove_fields: params.body.remove,
        })
    }

    fn edits_body(&self) -> bool {
        !self.add_fields.is_empty() || !self.remove_fields.is_empty()
    }

    fn apply_headers(&self, context: &RequestContext, headers: &mut HeaderMap) {
        for name in &self.remove_headers {
            headers.remove(name);
        }
        for (name, expression) in &self.add_headers {
            let value = match context.evaluate(expression) {
                Ok(value) => render(&value),
                Err(e) => {
                    warn!(header = %name, "Skipping header, expression failed: {}", e);
                    continue;
                }
            };
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    headers.insert(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Skipping header, value is not a valid header value"),
            }
        }
    }

    /// Rewritten body, or `None` when `body` is not a JSON object
    fn apply_body(&self, context: &RequestContext, body: Option<Value>) -> Option<Bytes> {
        let Some(Value::Object(mut object)) = body else {
            debug!("Body is not a JSON object, skipping body transform");
            return None;
        };
        for field in &self.remove_fields {
            object.remove(field);
        }
        for (field, expression) in &self.add_fields {
            match context.evaluate(expression) {
                Ok(value) => {
                    object.insert(field.clone(), value);
                }
                Err(e) => warn!(field = %field, "Skipping body field, expression failed: {}", e),
            }
        }
        serde_json::to_vec(&Value::Object(object)).ok().map(Bytes::from)
    }
}

/// Rewrites request headers and JSON body before forwarding
pub struct RequestTransformerPolicy {
    transform: Transform,
}

pub fn build_request(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    Ok(Arc::new(RequestTransformerPolicy {
        transform: Transform::build("request-transformer", action)?,
    }))
}

#[async_trait::async_trait]
impl Policy for RequestTransformerPolicy {
    fn name(&self) -> &'static str {
        "request-transformer"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        let mut headers = context.headers.clone();
        self.transform.apply_headers(context, &mut headers);
        context.headers = headers;

        if self.transform.edits_body() && context.is_json() {
            if let Some(body) = self.transform.apply_body(context, context.json_body()) {
                context.set_body(body);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Installs a hook rewriting the backend response headers and JSON body
pub struct ResponseTransformerPolicy {
    transform: Arc<Transform>,
}

pub fn build_response(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    Ok(Arc::new(ResponseTransformerPolicy {
        transform: Arc::new(Transform::build("response-transformer", action)?),
    }))
}

#[async_trait::async_trait]
impl Policy for ResponseTransformerPolicy {
    fn name(&self) -> &'static str {
        "response-transformer"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        context.add_response_hook(Arc::new(ResponseTransformHook {
            transform: self.transform.clone(),
        }));
        Ok(Flow::Continue)
    }
}

struct ResponseTransformHook {
    transform: Arc<Transform>,
}

impl ResponseHook for ResponseTransformHook {
    fn name(&self) -> &'static str {
        "response-transformer"
    }

    fn on_response(&self, context: &RequestContext, response: &mut GatewayResponse) {
        self.transform.apply_headers(context, &mut response.headers);
        if self.transform.edits_body() {
            if let Some(body) = self.transform.apply_body(context, response.json_body()) {
                response.set_body(body);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::policies::test_support::*;
    use gateway_core::GatewayResponse;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
    use hyper::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_request_headers_and_body() {
        let policy = build(
            "request-transformer",
            json!({
                "headers": {"add": {"x-pipeline": "'users'"}, "remove": ["cookie"]},
                "body": {"add": {"source": "'gateway'"}, "remove": ["password"]}
            }),
        )
        .unwrap();

        let mut ctx = request(
            Method::POST,
            "/",
            &[("content-type", "application/json"), ("cookie", "a=b")],
            r#"{"user":"alice","password":"secret"}"#,
        );
        policy.handle(&mut ctx).await.unwrap();

        assert_eq!(ctx.header("x-pipeline"), Some("users"));
        assert_eq!(ctx.header("cookie"), None);
        assert_eq!(ctx.json_body(), Some(json!({"user": "alice", "source": "gateway"})));
        assert_eq!(
            ctx.header("content-length"),
            Some(ctx.body().len().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_non_json_body_untouched() {
        let policy = build("request-transformer", json!({"body": {"add": {"a": "1"}}})).unwrap();
        let mut ctx = request(Method::POST, "/", &[("content-type", "text/plain")], "hello");
        policy.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.body(), &Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_response_hook() {
        let policy = build(
            "response-transformer",
            json!({
                "headers": {"add": {"x-served-by": "egContext.pipeline"}, "remove": ["server"]},
                "body": {"remove": ["internal"]}
            }),
        )
        .unwrap();

        let mut ctx = get("/");
        ctx.pipeline = Some("users".to_string());
        policy.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_hook_count(), 1);

        let mut response = GatewayResponse::new(StatusCode::OK)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_header(hyper::header::SERVER, HeaderValue::from_static("backend"));
        response.set_body(Bytes::from_static(br#"{"id":1,"internal":true}"#));

        ctx.apply_response_hooks(&mut response);
        assert_eq!(response.headers.get("x-served-by").unwrap(), "users");
        assert!(response.headers.get(hyper::header::SERVER).is_none());
        assert_eq!(response.json_body(), Some(json!({"id": 1})));
        assert_eq!(response.headers.get(CONTENT_LENGTH).unwrap(), "8");
    }
}
