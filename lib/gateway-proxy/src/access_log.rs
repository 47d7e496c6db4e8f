//! One structured access log event per request

use gateway_core::{GatewayResponse, RequestContext};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// The fields of an access log line
#[derive(Debug, PartialEq)]
pub struct AccessRecord<'a> {
    pub method: &'a str,
    pub backend: Option<&'a str>,
    pub url: String,
    pub status: u16,
    pub response_time: Duration,
    pub response_size: usize,
}

impl<'a> AccessRecord<'a> {
    pub fn new(context: &'a RequestContext, response: &GatewayResponse) -> Self {
        Self {
            method: context.method.as_str(),
            backend: context.target.as_deref(),
            url: context
                .original_uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            status: response.status.as_u16(),
            response_time: context.started_at().elapsed(),
            response_size: response.body.len(),
        }
    }

    pub fn response_time_ms(&self) -> f64 {
        self.response_time.as_secs_f64() * 1000.0
    }

    pub fn emit(&self) {
        info!(
            target: "gateway::access",
            method = self.method,
            backend = self.backend.unwrap_or("-"),
            url = %self.url,
            status = self.status,
            response_time_ms = self.response_time_ms(),
            response_size = self.response_size,
            "{}",
            self
        );
    }
}

impl fmt::Display for AccessRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {:.3} ms - {}",
            self.method,
            self.backend.unwrap_or("-"),
            self.url,
            self.status,
            self.response_time_ms(),
            self.response_size
        )
    }
}
