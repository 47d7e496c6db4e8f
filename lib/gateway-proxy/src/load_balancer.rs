//! Load balancing strategies for distributing traffic across service targets

use gateway_api::ServiceEndpointConfig;
use gateway_core::{CoreError, Result};
use hyper::http::uri::{Authority, Uri};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A backend base URL, validated once at build time
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceTarget {
    url: String,
    authority: Authority,
    base_path: String,
}

impl ServiceTarget {
    /// Parse an `http://host[:port][/base]` URL
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            CoreError::InvalidConfiguration(format!("service target {:?}: {}", url, reason))
        };

        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URL"))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some("https") => return Err(invalid("https backends are not supported")),
            _ => return Err(invalid("URL must start with http://")),
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("URL has no host"))?;
        if uri.query().is_some() {
            return Err(invalid("URL must not carry a query string"));
        }

        Ok(Self {
            url: url.to_string(),
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Absolute URI for a request path (and query) under this target
    pub fn join(&self, path_and_query: &str) -> String {
        let path_and_query = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        format!("http://{}{}{}", self.authority, self.base_path, path_and_query)
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Selects the backend serving the next proxied call
pub trait LoadBalancingStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn next_target(&self) -> &ServiceTarget;

    fn targets(&self) -> &[ServiceTarget];
}

/// Cycles through targets in order
///
/// The cursor is advanced with a single atomic update, so every call gets
/// exactly one target and concurrent calls never skip or repeat a slot.
#[derive(Debug)]
pub struct RoundRobin {
    targets: Vec<ServiceTarget>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(targets: Vec<ServiceTarget>) -> Result<Self> {
        if targets.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "round-robin strategy requires at least one target".to_string(),
            ));
        }
        Ok(Self {
            targets,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn next_target(&self) -> &ServiceTarget {
        let len = self.targets.len();
        let current = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);
        &self.targets[current % len]
    }

    fn targets(&self) -> &[ServiceTarget] {
        &self.targets
    }
}

/// Always the first target
#[derive(Debug)]
pub struct Static {
    targets: Vec<ServiceTarget>,
}

impl Static {
    pub fn new(targets: Vec<ServiceTarget>) -> Result<Self> {
        if targets.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "static strategy requires at least one target".to_string(),
            ));
        }
        Ok(Self { targets })
    }
}

impl LoadBalancingStrategy for Static {
    fn name(&self) -> &'static str {
        "static"
    }

    fn next_target(&self) -> &ServiceTarget {
        &self.targets[0]
    }

    fn targets(&self) -> &[ServiceTarget] {
        &self.targets
    }
}

/// Build the strategy for a service endpoint
///
/// `strategy` overrides the endpoint's own setting. Default is round-robin.
pub fn build_strategy(
    endpoint: &ServiceEndpointConfig,
    strategy: Option<&str>,
) -> Result<Arc<dyn LoadBalancingStrategy>> {
    let targets = endpoint
        .targets()
        .iter()
        .map(|url| ServiceTarget::parse(url))
        .collect::<Result<Vec<_>>>()?;

    match strategy.or(endpoint.strategy.as_deref()).unwrap_or("round-robin") {
        "round-robin" => Ok(Arc::new(RoundRobin::new(targets)?)),
        "static" => Ok(Arc::new(Static::new(targets)?)),
        other => Err(CoreError::InvalidConfiguration(format!(
            "unknown load balancing strategy: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(urls: &[&str]) -> Vec<ServiceTarget> {
        urls.iter().map(|u| ServiceTarget::parse(u).unwrap()).collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let lb = RoundRobin::new(targets(&["http://a:1", "http://b:2", "http://c:3"])).unwrap();
        let picked: Vec<&str> = (0..7).map(|_| lb.next_target().url()).collect();
        assert_eq!(
            picked,
            vec![
                "http://a:1", "http://b:2", "http://c:3", "http://a:1", "http://b:2", "http://c:3",
                "http://a:1"
            ]
        );
    }

    #[test]
    fn test_round_robin_is_fair_under_concurrency() {
        let lb = Arc::new(RoundRobin::new(targets(&["http://a", "http://b", "http://c"])).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                std::thread::spawn(move || {
                    (0..300)
                        .map(|_| lb.next_target().url().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for url in handle.join().unwrap() {
                *counts.entry(url).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 400));
    }

    #[test]
    fn test_static_always_first() {
        let lb = Static::new(targets(&["http://a", "http://b"])).unwrap();
        for _ in 0..5 {
            assert_eq!(lb.next_target().url(), "http://a");
        }
    }

    #[test]
    fn test_empty_targets_rejected() {
        assert!(RoundRobin::new(Vec::new()).is_err());
        assert!(Static::new(Vec::new()).is_err());
    }

    #[test]
    fn test_target_parse_and_join() {
        let target = ServiceTarget::parse("http://backend:8080/base/").unwrap();
        assert_eq!(target.authority().as_str(), "backend:8080");
        assert_eq!(target.join("/users?id=1"), "http://backend:8080/base/users?id=1");

        let root = ServiceTarget::parse("http://backend").unwrap();
        assert_eq!(root.join("/"), "http://backend/");
    }

    #[test]
    fn test_target_parse_rejects_unsupported() {
        assert!(ServiceTarget::parse("https://secure").is_err());
        assert!(ServiceTarget::parse("backend:80").is_err());
        assert!(ServiceTarget::parse("http://a/?q=1").is_err());
    }

    #[test]
    fn test_build_strategy() {
        let endpoint = ServiceEndpointConfig {
            url: Some("http://a".to_string()),
            ..Default::default()
        };
        assert_eq!(build_strategy(&endpoint, None).unwrap().name(), "round-robin");
        assert_eq!(build_strategy(&endpoint, Some("static")).unwrap().name(), "static");
        assert!(build_strategy(&endpoint, Some("random")).is_err());
        assert!(build_strategy(&ServiceEndpointConfig::default(), None).is_err());
    }
}
