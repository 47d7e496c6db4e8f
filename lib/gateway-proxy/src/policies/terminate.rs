use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{GatewayResponse, RequestContext};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateParams {
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default = "default_message")]
    message: String,
}

fn default_status() -> u16 {
    400
}

fn default_message() -> String {
    "Terminated".to_string()
}

/// Ends the chain with a fixed response
pub struct TerminatePolicy {
    status: StatusCode,
    message: String,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: TerminateParams = parse_params("terminate", action)?;
    let status = StatusCode::from_u16(params.status_code)
        .map_err(|_| invalid_params("terminate", format!("invalid statusCode {}", params.status_code)))?;
    Ok(Arc::new(TerminatePolicy {
        status,
        message: params.message,
    }))
}

#[async_trait::async_trait]
impl Policy for TerminatePolicy {
    fn name(&self) -> &'static str {
        "terminate"
    }

    async fn handle(&self, _context: &mut RequestContext) -> Result<Flow, PolicyError> {
        Ok(Flow::Halt(GatewayResponse::text(self.status, self.message.clone())))
    }
}
