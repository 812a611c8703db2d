//! Route table storage and lookup.

use axum::body::Body;
use axum::http::{Method, Request};
use regex::Regex;

use super::{Handler, Matcher};
use crate::helper;

/// One entry in the routing table.
pub struct RouteEntry {
    method: Option<Method>,
    regex: Option<Regex>,
    matchers: Vec<Matcher>,
    websocket: bool,
    /// Pattern text, used as the metrics label for this route.
    pattern: &'static str,
    pub handler: Handler,
}

impl RouteEntry {
    pub fn is_websocket(&self) -> bool {
        self.websocket
    }

    pub fn pattern(&self) -> &'static str {
        self.pattern
    }

    fn is_match(&self, cleaned_path: &str, req: &Request<Body>) -> bool {
        if let Some(method) = &self.method {
            if req.method() != method {
                return false;
            }
        }

        if let Some(regex) = &self.regex {
            if !regex.is_match(cleaned_path) {
                return false;
            }
        }

        self.matchers.iter().all(|m| m(req))
    }
}

/// Build a plain route. An empty pattern matches every path.
pub fn route(
    method: Option<Method>,
    pattern: &'static str,
    handler: Handler,
) -> RouteEntry {
    RouteEntry {
        method,
        regex: compile(pattern),
        matchers: Vec::new(),
        websocket: false,
        pattern,
        handler,
    }
}

/// Build a WebSocket route: GET only, and it requires an upgrade request.
pub fn ws_route(pattern: &'static str, handler: Handler) -> RouteEntry {
    RouteEntry {
        method: Some(Method::GET),
        regex: compile(pattern),
        matchers: vec![std::sync::Arc::new(|req: &Request<Body>| {
            helper::is_websocket_upgrade(req.headers())
        })],
        websocket: true,
        pattern,
        handler,
    }
}

impl RouteEntry {
    /// Add a predicate that must also hold for this entry to match.
    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }
}

/// Predicate: the request carries the given content type.
pub fn is_content_type(expected: &'static str) -> Matcher {
    std::sync::Arc::new(move |req: &Request<Body>| helper::request_has_content_type(req, expected))
}

fn compile(pattern: &'static str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    Some(Regex::new(pattern).expect("invalid route pattern"))
}

/// The ordered routing table.
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    url_prefix: String,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>, url_prefix: &str) -> Self {
        Self {
            entries,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Strip the configured URL prefix off a request path before matching.
    pub fn clean_path<'a>(&self, path: &'a str) -> &'a str {
        if self.url_prefix.is_empty() {
            return path;
        }
        match path.strip_prefix(self.url_prefix.as_str()) {
            Some(rest) if rest.is_empty() => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => path,
        }
    }

    /// Find the first entry matching this request.
    pub fn match_route(&self, req: &Request<Body>) -> Option<&RouteEntry> {
        let cleaned = self.clean_path(req.uri().path());
        self.entries.iter().find(|e| e.is_match(cleaned, req))
    }
}
