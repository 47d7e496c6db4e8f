use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{GatewayResponse, RequestContext, Template};
use hyper::header::{HeaderValue, LOCATION};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
struct RewriteParams {
    rewrite: String,
    redirect: Option<u16>,
}

/// Rewrites the forwarded path, or redirects the client
///
/// The template sees the request as received, so `${req.params.id}` and
/// friends can be used to build the new path.
pub struct RewritePolicy {
    template: Template,
    redirect: Option<StatusCode>,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: RewriteParams = parse_params("rewrite", action)?;
    let template = Template::parse(&params.rewrite)
        .map_err(|e| invalid_params("rewrite", format!("rewrite: {}", e)))?;
    let redirect = params
        .redirect
        .map(|code| match StatusCode::from_u16(code) {
            Ok(status) if status.is_redirection() => Ok(status),
            _ => Err(invalid_params("rewrite", format!("redirect {} is not a 3xx status", code))),
        })
        .transpose()?;

    Ok(Arc::new(RewritePolicy { template, redirect }))
}

#[async_trait::async_trait]
impl Policy for RewritePolicy {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        let rewritten = context.render(&self.template)?;

        if let Some(status) = self.redirect {
            let location = HeaderValue::from_str(&rewritten)
                .map_err(|_| PolicyError::Internal(format!("invalid redirect location {:?}", rewritten)))?;
            debug!("Redirecting {} to {}", context.path, rewritten);
            return Ok(Flow::Halt(GatewayResponse::new(status).with_header(LOCATION, location)));
        }

        let path = if rewritten.starts_with('/') {
            rewritten
        } else {
            format!("/{}", rewritten)
        };
        debug!("Rewriting path {} to {}", context.path, path);
        context.path = path;
        Ok(Flow::Continue)
    }
}
