//! Buffered response representation shared by policies and the proxy stage

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{HeaderMap, Response, StatusCode};
use serde_json::Value;

pub const NOT_FOUND_MESSAGE: &str = "Not found";
pub const BAD_GATEWAY_MESSAGE: &str = "Bad gateway.";
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

/// A fully buffered HTTP response
#[derive(Clone, Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response whose body is exactly `message`
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.set_body(Bytes::from(message.into()));
        response
    }

    pub fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
    }

    pub fn bad_gateway() -> Self {
        Self::text(StatusCode::BAD_GATEWAY, BAD_GATEWAY_MESSAGE)
    }

    pub fn internal_error() -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the body and keep the framing headers consistent
    pub fn set_body(&mut self, body: Bytes) {
        self.headers.remove(TRANSFER_ENCODING);
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = body;
    }

    pub fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    /// Parse the body as JSON when it is declared as JSON
    pub fn json_body(&self) -> Option<Value> {
        if !self.is_json() || self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
