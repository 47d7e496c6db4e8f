use crate::policy::{invalid_params, parse_params, BuildContext, Flow, Policy, PolicyError};
use gateway_api::OneOrMany;
use gateway_core::{GatewayResponse, RequestContext, ResponseHook};
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
    VARY,
};
use hyper::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorsParams {
    #[serde(default = "any_origin")]
    origin: OneOrMany<String>,
    #[serde(default = "default_methods")]
    methods: OneOrMany<String>,
    allowed_headers: Option<OneOrMany<String>>,
    exposed_headers: Option<OneOrMany<String>>,
    #[serde(default)]
    credentials: bool,
    max_age: Option<u64>,
    #[serde(default)]
    preflight_continue: bool,
}

fn any_origin() -> OneOrMany<String> {
    OneOrMany::One("*".to_string())
}

fn default_methods() -> OneOrMany<String> {
    OneOrMany::One("GET,HEAD,PUT,PATCH,POST,DELETE".to_string())
}

fn header_value(policy: &str, field: &str, values: &[String]) -> gateway_core::Result<HeaderValue> {
    HeaderValue::from_str(&values.join(","))
        .map_err(|_| invalid_params(policy, format!("{} contains invalid characters", field)))
}

/// Cross-origin resource sharing
///
/// Preflight requests are answered with 204 unless `preflightContinue` is
/// set. Other requests get the CORS headers through a response hook.
pub struct CorsPolicy {
    origins: Vec<String>,
    methods: HeaderValue,
    allowed_headers: Option<HeaderValue>,
    exposed_headers: Option<HeaderValue>,
    credentials: bool,
    max_age: Option<HeaderValue>,
    preflight_continue: bool,
}

pub fn build(action: &Value, _context: &BuildContext<'_>) -> gateway_core::Result<Arc<dyn Policy>> {
    let params: CorsParams = parse_params("cors", action)?;
    let origins = params.origin.to_vec();
    if origins.is_empty() {
        return Err(invalid_params("cors", "origin must not be empty"));
    }

    Ok(Arc::new(CorsPolicy {
        origins,
        methods: header_value("cors", "methods", &params.methods.to_vec())?,
        allowed_headers: params
            .allowed_headers
            .map(|h| header_value("cors", "allowedHeaders", &h.to_vec()))
            .transpose()?,
        exposed_headers: params
            .exposed_headers
            .map(|h| header_value("cors", "exposedHeaders", &h.to_vec()))
            .transpose()?,
        credentials: params.credentials,
        max_age: params.max_age.map(HeaderValue::from),
        preflight_continue: params.preflight_continue,
    }))
}

impl CorsPolicy {
    /// `Access-Control-Allow-Origin` for this request, if it is allowed
    fn allow_origin(&self, origin: Option<&str>) -> Option<HeaderValue> {
        let wildcard = self.origins.iter().any(|o| o == "*");
        match origin {
            Some(origin) if self.origins.iter().any(|o| o == origin) => HeaderValue::from_str(origin).ok(),
            Some(origin) if wildcard && self.credentials => HeaderValue::from_str(origin).ok(),
            _ if wildcard => Some(HeaderValue::from_static("*")),
            _ => None,
        }
    }

    fn common_headers(&self, allow_origin: HeaderValue, headers: &mut HeaderMap) {
        if allow_origin != "*" {
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if self.credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
    }

    fn preflight_headers(&self, context: &RequestContext, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.methods.clone());
        let allowed = self
            .allowed_headers
            .clone()
            .or_else(|| context.headers.get(ACCESS_CONTROL_REQUEST_HEADERS).cloned());
        if let Some(allowed) = allowed {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allowed);
        }
        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
    }
}

#[async_trait::async_trait]
impl Policy for CorsPolicy {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, context: &mut RequestContext) -> Result<Flow, PolicyError> {
        let Some(allow_origin) = self.allow_origin(context.header(ORIGIN.as_str())) else {
            return Ok(Flow::Continue);
        };

        let preflight =
            context.method == Method::OPTIONS && context.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD);

        if preflight && !self.preflight_continue {
            let mut response = GatewayResponse::new(StatusCode::NO_CONTENT);
            self.common_headers(allow_origin, &mut response.headers);
            self.preflight_headers(context, &mut response.headers);
            response.set_body(Default::default());
            return Ok(Flow::Halt(response));
        }

        let mut headers = HeaderMap::new();
        self.common_headers(allow_origin, &mut headers);
        if preflight {
            self.preflight_headers(context, &mut headers);
        } else if let Some(exposed) = &self.exposed_headers {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
        context.add_response_hook(Arc::new(CorsHeaders { headers }));
        Ok(Flow::Continue)
    }
}

struct CorsHeaders {
    headers: HeaderMap,
}

impl ResponseHook for CorsHeaders {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn on_response(&self, _context: &RequestContext, response: &mut GatewayResponse) {
        for (name, value) in &self.headers {
            if *name == VARY {
                response.headers.append(name.clone(), value.clone());
            } else {
                response.headers.insert(name.clone(), value.clone());
            }
        }
    }
}
