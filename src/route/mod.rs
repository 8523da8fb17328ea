//! Endpoint dispatch table shared by `BridgeService` and `HomeserverService`.
//!
//! Routes are matched in registration order so more specific patterns can be
//! registered ahead of broader ones; the handler type is generic so this
//! module has no dependency on the request/response types above it.

use regex::Regex;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
    Regex,
}

pub struct Route<H> {
    pattern: String,
    match_kind: MatchKind,
    regex: Option<Regex>,
    handler: H,
    description: Option<String>,
}

impl<H> Route<H> {
    fn matches(&self, path: &str) -> bool {
        match self.match_kind {
            MatchKind::Exact => path == self.pattern,
            MatchKind::Prefix => path.starts_with(&self.pattern),
            MatchKind::Regex => self
                .regex
                .as_ref()
                .map(|re| re.is_match(path))
                .unwrap_or(false),
        }
    }
}

impl<H> std::fmt::Debug for Route<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Route({:?}: {:?}{})",
            self.match_kind,
            self.pattern,
            self.description
                .as_ref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        )
    }
}

/// Ordered list of `(pattern, handler, match_kind)`; first registered match
/// wins. Regex patterns are validated eagerly at registration time so a bad
/// pattern fails at startup rather than on first request.
pub struct RouteRegistry<H> {
    routes: Vec<Route<H>>,
    fallback: Option<H>,
}

impl<H: Clone> RouteRegistry<H> {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: None,
        }
    }

    pub fn add_exact(&mut self, path: impl Into<String>, handler: H, description: Option<&str>) {
        self.routes.push(Route {
            pattern: path.into(),
            match_kind: MatchKind::Exact,
            regex: None,
            handler,
            description: description.map(str::to_string),
        });
    }

    pub fn add_prefix(&mut self, prefix: impl Into<String>, handler: H, description: Option<&str>) {
        self.routes.push(Route {
            pattern: prefix.into(),
            match_kind: MatchKind::Prefix,
            regex: None,
            handler,
            description: description.map(str::to_string),
        });
    }

    /// Registers a regex route. The pattern is compiled immediately;
    /// an invalid pattern is a programmer error and fails fast here rather
    /// than surfacing as a runtime routing failure.
    pub fn add_regex(&mut self, pattern: &str, handler: H, description: Option<&str>) -> AppResult<()> {
        let regex = Regex::new(pattern)
            .map_err(|e| AppError::Internal(format!("invalid regex route pattern '{pattern}': {e}")))?;
        self.routes.push(Route {
            pattern: pattern.to_string(),
            match_kind: MatchKind::Regex,
            regex: Some(regex),
            handler,
            description: description.map(str::to_string),
        });
        Ok(())
    }

    pub fn set_fallback(&mut self, handler: H) {
        self.fallback = Some(handler);
    }

    pub fn match_path(&self, path: &str) -> Option<H> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .map(|route| route.handler.clone())
    }

    pub fn match_or_fallback(&self, path: &str) -> AppResult<H> {
        if let Some(handler) = self.match_path(path) {
            return Ok(handler);
        }
        self.fallback
            .clone()
            .ok_or_else(|| AppError::RouteNotFound(format!("no route or fallback handler for path: {path}")))
    }

    pub fn routes(&self) -> &[Route<H>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<H: Clone> Default for RouteRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Chainable builder mirroring `RouteRegistry`'s registration methods.
pub struct RouteBuilder<H> {
    registry: RouteRegistry<H>,
}

impl<H: Clone> RouteBuilder<H> {
    pub fn new() -> Self {
        Self {
            registry: RouteRegistry::new(),
        }
    }

    pub fn exact(mut self, path: impl Into<String>, handler: H, description: Option<&str>) -> Self {
        self.registry.add_exact(path, handler, description);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>, handler: H, description: Option<&str>) -> Self {
        self.registry.add_prefix(prefix, handler, description);
        self
    }

    pub fn regex(mut self, pattern: &str, handler: H, description: Option<&str>) -> AppResult<Self> {
        self.registry.add_regex(pattern, handler, description)?;
        Ok(self)
    }

    pub fn fallback(mut self, handler: H) -> Self {
        self.registry.set_fallback(handler);
        self
    }

    pub fn build(self) -> RouteRegistry<H> {
        self.registry
    }
}

impl<H: Clone> Default for RouteBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registered_match_wins() {
        let mut registry: RouteRegistry<&'static str> = RouteRegistry::new();
        registry.add_prefix("_matrix/client/v3/profile/", "generic_profile", None);
        registry.add_exact("_matrix/client/v3/profile/@x/avatar_url", "specific_avatar", None);
        let handler = registry.match_path("_matrix/client/v3/profile/@x/avatar_url").unwrap();
        assert_eq!(handler, "generic_profile");
    }

    #[test]
    fn fallback_used_when_nothing_matches() {
        let mut registry: RouteRegistry<&'static str> = RouteRegistry::new();
        registry.add_exact("_matrix/client/versions", "versions", None);
        registry.set_fallback("fallback");
        assert_eq!(registry.match_or_fallback("nope").unwrap(), "fallback");
    }

    #[test]
    fn no_match_no_fallback_is_route_not_found() {
        let registry: RouteRegistry<&'static str> = RouteRegistry::new();
        let err = registry.match_or_fallback("anything").unwrap_err();
        assert!(matches!(err, AppError::RouteNotFound(_)));
    }

    #[test]
    fn invalid_regex_fails_fast() {
        let mut registry: RouteRegistry<&'static str> = RouteRegistry::new();
        let err = registry.add_regex("(unterminated", "h", None).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
