//! Compiled API endpoint match rules

use crate::{CoreError, Result};
use gateway_api::ApiEndpointConfig;
use hyper::Method;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Host rule: `*`, `*.example.com` or an exact host name
#[derive(Clone, Debug, PartialEq)]
pub enum HostPattern {
    Any,
    Suffix(String),
    Exact(String),
}

impl HostPattern {
    pub fn parse(pattern: Option<&str>) -> Result<Self> {
        let pattern = match pattern.map(str::trim) {
            None | Some("") | Some("*") => return Ok(HostPattern::Any),
            Some(p) => p.to_ascii_lowercase(),
        };

        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err(CoreError::InvalidPattern {
                    pattern,
                    reason: "host wildcard must be a single leading '*.' label".to_string(),
                });
            }
            return Ok(HostPattern::Suffix(format!(".{}", suffix)));
        }

        if pattern.contains('*') {
            return Err(CoreError::InvalidPattern {
                pattern,
                reason: "host wildcard must be a single leading '*.' label".to_string(),
            });
        }
        Ok(HostPattern::Exact(pattern))
    }

    /// `host` must already be lowercased and stripped of its port
    pub fn matches(&self, host: Option<&str>) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Suffix(suffix) => host
                .map(|h| h.len() > suffix.len() && h.ends_with(suffix.as_str()))
                .unwrap_or(false),
            HostPattern::Exact(exact) => host == Some(exact.as_str()),
        }
    }
}

/// Path rule compiled to an anchored regular expression
#[derive(Clone, Debug)]
pub struct PathPattern {
    source: String,
    prefix: String,
    regex: Regex,
}

impl PathPattern {
    /// Compile an express-style pattern
    ///
    /// `*` alone matches every path. Otherwise the pattern starts with `/`,
    /// `:name` segments capture a parameter and a final `*` segment matches
    /// the bare prefix and anything below it.
    pub fn compile(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| CoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern == "*" {
            return Self::from_regex(pattern, "^.*$");
        }
        if !pattern.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        if pattern == "/" {
            return Self::from_regex(pattern, "^/$");
        }

        let segments: Vec<&str> = pattern[1..].trim_end_matches('/').split('/').collect();
        let mut regex = String::from("^");
        let mut prefix = String::new();
        let mut literal = true;
        let mut wildcard = false;

        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            if *segment == "*" {
                if !last {
                    return Err(invalid("'*' is only allowed as the last segment"));
                }
                wildcard = true;
                literal = false;
                continue;
            }
            if segment.contains('*') {
                return Err(invalid("'*' must be a whole segment"));
            }
            if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid("parameter names must be non-empty identifiers"));
                }
                if name.starts_with(|c: char| c.is_ascii_digit()) {
                    return Err(invalid("parameter names must not start with a digit"));
                }
                regex.push_str(&format!("/(?P<{}>[^/]+)", name));
                literal = false;
            } else {
                regex.push('/');
                regex.push_str(&regex::escape(segment));
                if literal {
                    prefix.push('/');
                    prefix.push_str(segment);
                }
            }
        }

        if wildcard {
            regex.push_str("(?:/.*)?$");
        } else {
            regex.push_str("/?$");
        }

        let mut compiled = Self::from_regex(pattern, &regex)?;
        compiled.prefix = prefix;
        Ok(compiled)
    }

    /// Use a raw regular expression; named groups become parameters
    pub fn from_regex(source: &str, regex: &str) -> Result<Self> {
        let regex = Regex::new(regex).map_err(|e| CoreError::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            prefix: String::new(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Literal leading segments, up to the first parameter or wildcard
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Captured parameters when `path` matches
    pub fn captures(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let params = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        Some(params)
    }
}

/// A named API endpoint compiled for request matching
#[derive(Clone, Debug)]
pub struct RouteMatcher {
    name: String,
    host: HostPattern,
    paths: Vec<PathPattern>,
    methods: Vec<Method>,
}

impl RouteMatcher {
    pub fn compile(name: &str, config: &ApiEndpointConfig) -> Result<Self> {
        let host = HostPattern::parse(config.host.as_deref())?;

        let mut paths = Vec::new();
        if let Some(regex) = &config.path_regex {
            paths.push(PathPattern::from_regex(regex, regex)?);
        }
        if config.path_regex.is_none() || config.paths.is_some() {
            for pattern in config.path_patterns() {
                paths.push(PathPattern::compile(&pattern)?);
            }
        }

        let methods = config
            .method_list()
            .iter()
            .map(|m| {
                Method::from_str(&m.to_ascii_uppercase()).map_err(|_| CoreError::InvalidPattern {
                    pattern: m.clone(),
                    reason: format!("invalid HTTP method in API endpoint {:?}", name),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            host,
            paths,
            methods,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Path parameters when host, method and path all match
    ///
    /// `None` for `host` or `method` skips that check.
    pub fn matches(
        &self,
        host: Option<&str>,
        method: Option<&Method>,
        path: &str,
    ) -> Option<BTreeMap<String, String>> {
        if let Some(host) = host {
            if !self.host.matches(Some(host)) {
                return None;
            }
        }
        if let Some(method) = method {
            if !self.matches_method(method) {
                return None;
            }
        }
        self.paths.iter().find_map(|p| p.captures(path))
    }

    /// Literal prefix of the first path pattern matching `path`
    pub fn matched_prefix(&self, path: &str) -> Option<&str> {
        self.paths
            .iter()
            .find(|p| p.regex.is_match(path))
            .map(PathPattern::prefix)
    }
}
