use crate::limiter::{WindowHit, WindowLimiter};
use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_core::{GatewayResponse, RequestContext, ResponseHook, Template};
use hyper::header::{HeaderName, HeaderValue, RETRY_AFTER};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_KEY: &str = "*";
const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitParams {
    #[serde(default = "default_window_ms")]
    window_ms: u64,
    #[serde(default = "default_max")]
    max: u64,
    #[serde(default)]
    delay_after: u64,
    #[serde(default)]
    delay_ms: u64,
    rate_limit_by: Option<String>,
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default = "default_message")]
    message: String,
    #[serde(default = "enabled")]
    headers: bool,
    max_keys: Option<usize>,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max() -> u64 {
    5
}

fn default_status() -> u16 {
    429
}

pub(crate) fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

fn enabled() -> bool {
    true
}

/// Keyed fixed-window request limiter
///
/// Requests beyond `delayAfter` in a window are delayed by `delayMs`;
/// requests beyond `max` are rejected.
pub struct RateLimitPolicy {
    limiter: WindowLimiter,
    key: Option<Template>,
    delay_after: u64,
    delay: Duration,
    status: StatusCode,
    message: String,
    headers: bool,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: RateLimitParams = parse_params("rate-limit", action)?;
    if params.window_ms == 0 {
        return Err(invalid_params("rate-limit", "windowMs must be greater than 0"));
    }
    let status = StatusCode::from_u16(params.status_code)
        .map_err(|_| invalid_params("rate-limit", format!("invalid statusCode {}", params.status_code)))?;
    let max_keys = match params.max_keys {
        Some(n) => Some(
            NonZeroUsize::new(n).ok_or_else(|| invalid_params("rate-limit", "maxKeys must be greater than 0"))?,
        ),
        None => None,
    };
    let key = params
        .rate_limit_by
        .as_deref()
        .map(Template::parse)
        .transpose()
        .map_err(|e| invalid_params("rate-limit", format!("rateLimitBy: {}", e)))?;

    Ok(Arc::new(RateLimitPolicy {
        limiter: WindowLimiter::new(Duration::from_millis(params.window_ms), params.max, max_keys),
        key,
        delay_after: params.delay_after,
        delay: Duration::from_millis(params.delay_ms),
        status,
        message: params.message,
        headers: params.headers,
    }))
}

impl RateLimitPolicy {
    fn key(&self, context: &RequestContext) -> String {
        let Some(template) = &self.key else {
            return DEFAULT_KEY.to_string();
        };
        match context.render(template) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    template = template.source(),
                    "Rate limit key evaluation failed, using the shared key: {}", e
                );
                DEFAULT_KEY.to_string()
            }
        }
    }

    fn rejection(&self, hit: &WindowHit) -> GatewayResponse {
        let mut response = GatewayResponse::text(self.status, self.message.clone());
        if self.headers {
            RateLimitHeaders::from(hit).apply(&mut response);
            let retry_after = hit.reset_at.saturating_duration_since(Instant::now());
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.headers.insert(RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[async_trait::async_trait]
impl Policy for RateLimitPolicy {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        let key = self.key(context);
        let hit = self.limiter.hit(&key);

        if hit.exceeded() {
            debug!("Rate limit exceeded for key {} ({} > {})", key, hit.count, hit.limit);
            return Ok(Flow::Halt(self.rejection(&hit)));
        }

        if self.headers {
            context.add_response_hook(Arc::new(RateLimitHeaders::from(&hit)));
        }

        if self.delay_after > 0 && hit.count > self.delay_after && !self.delay.is_zero() {
            debug!("Delaying request for key {} by {:?}", key, self.delay);
            tokio::time::sleep(self.delay).await;
        }

        Ok(Flow::Continue)
    }
}

/// Adds `X-RateLimit-*` headers to the response
struct RateLimitHeaders {
    limit: u64,
    remaining: u64,
}

impl From<&WindowHit> for RateLimitHeaders {
    fn from(hit: &WindowHit) -> Self {
        Self {
            limit: hit.limit,
            remaining: hit.remaining(),
        }
    }
}

impl RateLimitHeaders {
    fn apply(&self, response: &mut GatewayResponse) {
        response
            .headers
            .insert(HeaderName::from_static(X_RATELIMIT_LIMIT), HeaderValue::from(self.limit));
        response.headers.insert(
            HeaderName::from_static(X_RATELIMIT_REMAINING),
            HeaderValue::from(self.remaining),
        );
    }
}

impl ResponseHook for RateLimitHeaders {
    fn name(&self) -> &'static str {
        "rate-limit-headers"
    }

    fn on_response(&self, _context: &RequestContext, response: &mut GatewayResponse) {
        self.apply(response);
    }
}

#[cfg(test)]
mod tests {
    use crate::policies::test_support::*;
    use crate::policy::Flow;
    use gateway_core::GatewayResponse;
    use hyper::{Method, StatusCode};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sixth_request_rejected_then_window_resets() {
        let policy = build("rate-limit", json!({"max": 5, "windowMs": 1000})).unwrap();
        for _ in 0..5 {
            assert!(matches!(policy.handle(&mut get("/")).await.unwrap(), Flow::Continue));
        }

        let response = halted(policy.handle(&mut get("/")).await.unwrap());
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(&response), "Too many requests, please try again later.");
        assert_eq!(response.headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers.get("retry-after").unwrap(), "1");

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(matches!(policy.handle(&mut get("/")).await.unwrap(), Flow::Continue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_by_template() {
        let policy = build(
            "rate-limit",
            json!({"max": 1, "rateLimitBy": "${req.headers['x-user']}", "statusCode": 503, "message": "slow"}),
        )
        .unwrap();
        let alice = || request(Method::GET, "/", &[("x-user", "alice")], "");
        let bob = || request(Method::GET, "/", &[("x-user", "bob")], "");

        assert!(matches!(policy.handle(&mut alice()).await.unwrap(), Flow::Continue));
        assert!(matches!(policy.handle(&mut bob()).await.unwrap(), Flow::Continue));
        let response = halted(policy.handle(&mut alice()).await.unwrap());
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(&response), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_failure_falls_back_to_shared_bucket() {
        let policy = build("rate-limit", json!({"max": 1, "rateLimitBy": "${req.body.user}"})).unwrap();
        // no body: `req.body` is null, so `.user` fails and both share one key
        assert!(matches!(policy.handle(&mut get("/a")).await.unwrap(), Flow::Continue));
        let response = halted(policy.handle(&mut get("/b")).await.unwrap());
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_hook_registered() {
        let policy = build("rate-limit", json!({"max": 3})).unwrap();
        let mut ctx = get("/");
        policy.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_hook_count(), 1);

        let mut response = GatewayResponse::new(StatusCode::OK);
        ctx.apply_response_hooks(&mut response);
        assert_eq!(response.headers.get("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(response.headers.get("x-ratelimit-remaining").unwrap(), "2");

        let quiet = build("rate-limit", json!({"max": 3, "headers": false})).unwrap();
        let mut ctx = get("/");
        quiet.handle(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_hook_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_after() {
        let policy = build("rate-limit", json!({"max": 10, "delayAfter": 1, "delayMs": 500})).unwrap();
        let start = tokio::time::Instant::now();
        policy.handle(&mut get("/")).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        policy.handle(&mut get("/")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_params() {
        assert!(build("rate-limit", json!({"windowMs": 0})).is_err());
        assert!(build("rate-limit", json!({"maxKeys": 0})).is_err());
        assert!(build("rate-limit", json!({"rateLimitBy": "${req."})).is_err());
    }
}
