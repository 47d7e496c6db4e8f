use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{RequestContext, Template};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Deserialize)]
struct LogParams {
    message: String,
}

/// Logs a templated message for each request
pub struct LogPolicy {
    message: Template,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: LogParams = parse_params("log", action)?;
    let message = Template::parse(&params.message)
        .map_err(|e| invalid_params("log", format!("message: {}", e)))?;
    Ok(Arc::new(LogPolicy { message }))
}

#[async_trait::async_trait]
impl Policy for LogPolicy {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        match context.render(&self.message) {
            Ok(message) => info!(target: "gateway::policy::log", request_id = %context.request_id(), "{}", message),
            Err(e) => warn!(template = self.message.source(), "Log message evaluation failed: {}", e),
        }
        Ok(Flow::Continue)
    }
}
