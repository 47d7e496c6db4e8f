use crate::limiter::GroupThrottle;
use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_api::OneOrMany;
use gateway_core::{GatewayResponse, RequestContext};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct ThrottleGroupParams {
    groups: OneOrMany<String>,
}

/// Tags the request with throttle groups for a later `throttle` policy
pub struct ThrottleGroupPolicy {
    groups: Vec<String>,
}

pub fn build_group(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: ThrottleGroupParams = parse_params("throttle-group", action)?;
    let groups = params.groups.to_vec();
    if groups.is_empty() || groups.iter().any(|g| g.is_empty()) {
        return Err(invalid_params("throttle-group", "groups must be non-empty names"));
    }
    Ok(Arc::new(ThrottleGroupPolicy { groups }))
}

#[async_trait::async_trait]
impl Policy for ThrottleGroupPolicy {
    fn name(&self) -> &'static str {
        "throttle-group"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        context.throttle_groups.extend(self.groups.iter().cloned());
        Ok(Flow::Continue)
    }
}

#[derive(Deserialize)]
struct GroupLimit {
    rate: u64,
    #[serde(default = "default_period_ms")]
    period: u64,
}

fn default_period_ms() -> u64 {
    1000
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThrottleParams {
    groups: BTreeMap<String, GroupLimit>,
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default = "super::rate_limit::default_message")]
    message: String,
}

fn default_status() -> u16 {
    429
}

/// Token-bucket limiter per throttle group
///
/// A request tagged with several groups is admitted only when every one of
/// them has a token; then one token is taken from each.
pub struct ThrottlePolicy {
    throttle: GroupThrottle,
    status: StatusCode,
    message: String,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: ThrottleParams = parse_params("throttle", action)?;
    if params.groups.is_empty() {
        return Err(invalid_params("throttle", "at least one group is required"));
    }
    if let Some((name, _)) = params.groups.iter().find(|(_, limit)| limit.period == 0) {
        return Err(invalid_params("throttle", format!("group {:?}: period must be greater than 0", name)));
    }
    let status = StatusCode::from_u16(params.status_code)
        .map_err(|_| invalid_params("throttle", format!("invalid statusCode {}", params.status_code)))?;

    let throttle = GroupThrottle::new(
        params
            .groups
            .iter()
            .map(|(name, limit)| (name.as_str(), limit.rate, Duration::from_millis(limit.period))),
    );

    Ok(Arc::new(ThrottlePolicy {
        throttle,
        status,
        message: params.message,
    }))
}

#[async_trait::async_trait]
impl Policy for ThrottlePolicy {
    fn name(&self) -> &'static str {
        "throttle"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        match self
            .throttle
            .try_acquire(context.throttle_groups.iter().map(String::as_str))
        {
            Ok(()) => Ok(Flow::Continue),
            Err(group) => {
                debug!("Throttle group {} exhausted", group);
                Ok(Flow::Halt(GatewayResponse::text(self.status, self.message.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::policies::test_support::*;
    use crate::policy::Flow;
    use gateway_core::RequestContext;
    use hyper::StatusCode;
    use serde_json::json;

    fn tagged(groups: &[&str]) -> RequestContext {
        let mut ctx = get("/");
        ctx.throttle_groups.extend(groups.iter().map(|g| g.to_string()));
        ctx
    }

    #[tokio::test]
    async fn test_group_tagging() {
        let policy = build("throttle-group", json!({"groups": ["a", "b"]})).unwrap();
        let mut ctx = get("/");
        policy.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.throttle_groups.len(), 2);

        let single = build("throttle-group", json!({"groups": "c"})).unwrap();
        single.handle(&mut ctx).await.unwrap();
        assert!(ctx.throttle_groups.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_group_rejects_whole_request() {
        let policy = build(
            "throttle",
            json!({"groups": {"A": {"rate": 1, "period": 1000}, "B": {"rate": 100, "period": 1000}}}),
        )
        .unwrap();

        assert!(matches!(policy.handle(&mut tagged(&["A", "B"])).await.unwrap(), Flow::Continue));
        let response = halted(policy.handle(&mut tagged(&["A", "B"])).await.unwrap());
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(&response), "Too many requests, please try again later.");

        assert!(matches!(policy.handle(&mut tagged(&["B"])).await.unwrap(), Flow::Continue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_untagged_requests_pass() {
        let policy = build("throttle", json!({"groups": {"A": {"rate": 0}}})).unwrap();
        assert!(matches!(policy.handle(&mut get("/")).await.unwrap(), Flow::Continue));
        assert!(matches!(policy.handle(&mut tagged(&["A"])).await.unwrap(), Flow::Halt(_)));
    }

    #[test]
    fn test_invalid_params() {
        assert!(build("throttle", json!({"groups": {}})).is_err());
        assert!(build("throttle", json!({"groups": {"A": {"rate": 1, "period": 0}}})).is_err());
        assert!(build("throttle-group", json!({"groups": []})).is_err());
    }
}
