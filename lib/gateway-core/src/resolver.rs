//! Pipeline resolver: maps an inbound request to the pipeline serving it

use crate::route::RouteMatcher;
use crate::{CoreError, Result};
use gateway_api::{GatewayConfig, PipelineConfig};
use hyper::Method;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// The parts of a request used for pipeline selection
///
/// `None` for `host` or `method` skips that part of the match.
#[derive(Clone, Copy, Debug)]
pub struct RequestTarget<'a> {
    pub host: Option<&'a str>,
    pub method: Option<&'a Method>,
    pub path: &'a str,
}

impl<'a> RequestTarget<'a> {
    pub fn path(path: &'a str) -> Self {
        Self {
            host: None,
            method: None,
            path,
        }
    }
}

/// Result of a successful resolution
#[derive(Debug)]
pub struct Resolved<'a, P> {
    pub pipeline_name: &'a str,
    pub api_endpoint: &'a str,
    pub params: BTreeMap<String, String>,
    /// Literal prefix of the matched path pattern
    pub route_prefix: &'a str,
    pub pipeline: &'a P,
}

struct Entry<P> {
    name: String,
    endpoints: Vec<Arc<RouteMatcher>>,
    pipeline: P,
}

/// Ordered table of `(match rules, pipeline)` pairs
///
/// Built once per configuration version. Resolution is a pure lookup: the
/// first registered pipeline whose endpoints match wins. Additional matches
/// are reported once per pipeline pair and never change the decision.
pub struct PipelineResolver<P> {
    entries: Vec<Entry<P>>,
    reported: Mutex<HashSet<(usize, usize)>>,
}

impl<P> PipelineResolver<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Register a pipeline after all previously registered ones
    pub fn register(
        &mut self,
        name: impl Into<String>,
        endpoints: Vec<Arc<RouteMatcher>>,
        pipeline: P,
    ) {
        self.entries.push(Entry {
            name: name.into(),
            endpoints,
            pipeline,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pipelines(&self) -> impl Iterator<Item = (&str, &P)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.pipeline))
    }

    /// Select the pipeline for `target`; `None` is a routing miss
    pub fn resolve(&self, target: &RequestTarget<'_>) -> Option<Resolved<'_, P>> {
        let mut found: Option<(usize, Resolved<'_, P>)> = None;

        for (index, entry) in self.entries.iter().enumerate() {
            let matched = entry.endpoints.iter().find_map(|endpoint| {
                endpoint
                    .matches(target.host, target.method, target.path)
                    .map(|params| (endpoint.as_ref(), params))
            });

            let Some((endpoint, params)) = matched else {
                continue;
            };

            match &found {
                None => {
                    found = Some((
                        index,
                        Resolved {
                            pipeline_name: &entry.name,
                            api_endpoint: endpoint.name(),
                            params,
                            route_prefix: endpoint.matched_prefix(target.path).unwrap_or(""),
                            pipeline: &entry.pipeline,
                        },
                    ));
                }
                Some((first, resolved)) => {
                    self.report_ambiguity(*first, index, resolved.pipeline_name, &entry.name, target);
                }
            }
        }

        found.map(|(_, resolved)| resolved)
    }

    /// Resolve on path alone, ignoring host and method rules
    pub fn resolve_path(&self, path: &str) -> Option<Resolved<'_, P>> {
        self.resolve(&RequestTarget::path(path))
    }

    fn report_ambiguity(
        &self,
        first: usize,
        other: usize,
        chosen: &str,
        shadowed: &str,
        target: &RequestTarget<'_>,
    ) {
        let first_report = self
            .reported
            .lock()
            .map(|mut seen| seen.insert((first, other)))
            .unwrap_or(true);
        if first_report {
            warn!(
                path = target.path,
                chosen = chosen,
                shadowed = shadowed,
                "Request matches more than one pipeline; using the first registered"
            );
        }
    }
}

impl<P> Default for PipelineResolver<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile every API endpoint declared in `config`
pub fn compile_api_endpoints(config: &GatewayConfig) -> Result<HashMap<String, Arc<RouteMatcher>>> {
    config
        .api_endpoints
        .iter()
        .map(|(name, endpoint)| Ok((name.clone(), Arc::new(RouteMatcher::compile(name, endpoint)?))))
        .collect()
}

/// The compiled endpoints a pipeline is bound to, in declaration order
pub fn pipeline_endpoints(
    pipeline_name: &str,
    pipeline: &PipelineConfig,
    compiled: &HashMap<String, Arc<RouteMatcher>>,
) -> Result<Vec<Arc<RouteMatcher>>> {
    let names = pipeline.endpoint_names();
    if names.is_empty() {
        return Err(CoreError::InvalidConfiguration(format!(
            "pipeline {:?} has no apiEndpoints",
            pipeline_name
        )));
    }
    names
        .iter()
        .map(|name| {
            compiled
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownApiEndpoint {
                    pipeline: pipeline_name.to_string(),
                    endpoint: name.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_api::ApiEndpointConfig;

    fn endpoint(name: &str, paths: &[&str]) -> Arc<RouteMatcher> {
        let config = ApiEndpointConfig {
            paths: Some(gateway_api::OneOrMany::Many(
                paths.iter().map(|p| p.to_string()).collect(),
            )),
            ..Default::default()
        };
        Arc::new(RouteMatcher::compile(name, &config).unwrap())
    }

    fn resolver() -> PipelineResolver<&'static str> {
        let mut resolver = PipelineResolver::new();
        resolver.register("users", vec![endpoint("users-api", &["/users/:id", "/users"])], "users");
        resolver.register("admin", vec![endpoint("admin-api", &["/admin/*"])], "admin");
        resolver.register("catch-all", vec![endpoint("everything", &["*"])], "catch-all");
        resolver
    }

    #[test]
    fn test_single_match() {
        let mut resolver = PipelineResolver::new();
        resolver.register("users", vec![endpoint("users-api", &["/users/:id"])], 1);
        resolver.register("admin", vec![endpoint("admin-api", &["/admin/*"])], 2);

        let resolved = resolver.resolve_path("/users/7").unwrap();
        assert_eq!(*resolved.pipeline, 1);
        assert_eq!(resolved.pipeline_name, "users");
        assert_eq!(resolved.api_endpoint, "users-api");
        assert_eq!(resolved.params.get("id").map(String::as_str), Some("7"));
        assert_eq!(resolved.route_prefix, "/users");

        assert_eq!(*resolver.resolve_path("/admin/x").unwrap().pipeline, 2);
    }

    #[test]
    fn test_no_match_is_routing_miss() {
        let mut resolver = PipelineResolver::new();
        resolver.register("users", vec![endpoint("users-api", &["/users"])], ());
        assert!(resolver.resolve_path("/orders").is_none());
        assert!(PipelineResolver::<()>::new().resolve_path("/").is_none());
    }

    #[test]
    fn test_first_registered_wins_deterministically() {
        let resolver = resolver();
        for _ in 0..10 {
            assert_eq!(*resolver.resolve_path("/admin/settings").unwrap().pipeline, "admin");
            assert_eq!(*resolver.resolve_path("/users").unwrap().pipeline, "users");
        }
        assert_eq!(*resolver.resolve_path("/other").unwrap().pipeline, "catch-all");
    }

    #[test]
    fn test_host_and_method_rules() {
        let config = ApiEndpointConfig {
            host: Some("api.example.com".to_string()),
            methods: Some(gateway_api::OneOrMany::One("GET".to_string())),
            ..Default::default()
        };
        let mut resolver = PipelineResolver::new();
        resolver.register("api", vec![Arc::new(RouteMatcher::compile("api", &config).unwrap())], "api");

        let get = Method::GET;
        let post = Method::POST;
        let hit = RequestTarget {
            host: Some("api.example.com"),
            method: Some(&get),
            path: "/x",
        };
        assert!(resolver.resolve(&hit).is_some());
        assert!(resolver
            .resolve(&RequestTarget { method: Some(&post), ..hit })
            .is_none());
        assert!(resolver
            .resolve(&RequestTarget { host: Some("other"), ..hit })
            .is_none());
    }

    #[test]
    fn test_unknown_api_endpoint_is_rejected() {
        let config = GatewayConfig::from_yaml_str(
            r#"
apiEndpoints:
  api:
    paths: /api/*
pipelines:
  main:
    apiEndpoints: [api, missing]
    policies: []
"#,
        )
        .unwrap();
        let compiled = compile_api_endpoints(&config).unwrap();
        let err = pipeline_endpoints("main", &config.pipelines["main"], &compiled).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnknownApiEndpoint { ref endpoint, .. } if endpoint == "missing"
        ));
    }

    #[test]
    fn test_pipeline_endpoints_are_tried_in_order() {
        let mut resolver = PipelineResolver::new();
        resolver.register(
            "multi",
            vec![endpoint("first", &["/a/*"]), endpoint("second", &["/a/b"])],
            (),
        );
        assert_eq!(resolver.resolve_path("/a/b").unwrap().api_endpoint, "first");
        assert_eq!(resolver.len(), 1);
    }
}
