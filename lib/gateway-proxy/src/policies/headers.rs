use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{render, Expression, RequestContext};
use hyper::header::{HeaderName, HeaderValue};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadersParams {
    #[serde(default)]
    headers_prefix: String,
    #[serde(default)]
    forward_headers: IndexMap<String, String>,
}

/// Sets request headers from expressions before forwarding
pub struct HeadersPolicy {
    headers: Vec<(HeaderName, Expression)>,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: HeadersParams = parse_params("headers", action)?;
    let headers = params
        .forward_headers
        .iter()
        .map(|(name, expression)| {
            let full = format!("{}{}", params.headers_prefix, name);
            let header = HeaderName::from_bytes(full.as_bytes())
                .map_err(|_| invalid_params("headers", format!("invalid header name {:?}", full)))?;
            let expression = Expression::parse(expression)
                .map_err(|e| invalid_params("headers", format!("{}: {}", full, e)))?;
            Ok((header, expression))
        })
        .collect::<gateway_core::Result<Vec<_>>>()?;

    Ok(Arc::new(HeadersPolicy { headers }))
}

#[async_trait::async_trait]
impl Policy for HeadersPolicy {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        for (name, expression) in &self.headers {
            let value = match context.evaluate(expression) {
                Ok(value) => render(&value),
                Err(e) => {
                    warn!(header = %name, "Skipping header, expression failed: {}", e);
                    continue;
                }
            };
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    context.headers.insert(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "Skipping header, value is not a valid header value"),
            }
        }
        Ok(Flow::Continue)
    }
}
