//! URI pattern table over `matchit`.
//!
//! Patterns are `/`-separated. A segment is either static (`echo`), a named
//! parameter (`:id`) or, as the last segment only, a wildcard capturing the
//! rest of the path (`*rest`). Static segments win over parameters, and a
//! position reached through the same prefix binds under a single name.

use std::collections::{BTreeMap, HashSet};

/// Errors from adding or matching routes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route already registered: {0}")]
    Duplicate(String),
    #[error("invalid route pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("no route matches {0}")]
    NotFound(String),
}

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<H> {
    /// The registered pattern that matched.
    pub pattern: String,
    pub path_params: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub handle: H,
}

struct Entry<H> {
    pattern: String,
    handle: H,
}

/// URI pattern table.
pub struct UriTrie<H> {
    router: matchit::Router<Entry<H>>,
    patterns: HashSet<String>,
}

impl<H: Clone> UriTrie<H> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            router: matchit::Router::new(),
            patterns: HashSet::new(),
        }
    }

    /// Registers `pattern`.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the same pattern exists, `InvalidPattern` for a
    /// non-final wildcard, an empty parameter name, a parameter renaming one
    /// registered at the same position or a pattern conflicting with a
    /// registered one.
    pub fn add(&mut self, pattern: &str, handle: H) -> Result<(), RouteError> {
        let (canonical, route) = translate(pattern)?;
        if self.patterns.contains(&canonical) {
            return Err(RouteError::Duplicate(canonical));
        }
        if let Some((existing, ours)) = self
            .patterns
            .iter()
            .find_map(|registered| renamed_param(registered, &canonical))
        {
            return Err(RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!("parameter {ours} conflicts with {existing} of a registered route"),
            });
        }
        self.router
            .insert(route, Entry {
                pattern: canonical.clone(),
                handle,
            })
            .map_err(|e| RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        self.patterns.insert(canonical);
        Ok(())
    }

    /// Removes `pattern`, returning its handle.
    pub fn remove(&mut self, pattern: &str) -> Option<H> {
        let (canonical, route) = translate(pattern).ok()?;
        if !self.patterns.remove(&canonical) {
            return None;
        }
        self.router.remove(route).map(|entry| entry.handle)
    }

    /// Matches a concrete uri (optionally with a query string).
    ///
    /// # Errors
    ///
    /// `NotFound` when no pattern matches the path.
    pub fn match_uri(&self, uri: &str) -> Result<RouteMatch<H>, RouteError> {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };
        let path = canonical(&split_path(path));
        let matched = self
            .router
            .at(&path)
            .map_err(|_| RouteError::NotFound(uri.to_string()))?;
        Ok(RouteMatch {
            pattern: matched.value.pattern.clone(),
            path_params: matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            query_params: query.map(parse_query).unwrap_or_default(),
            handle: matched.value.handle.clone(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl<H: Clone> Default for UriTrie<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical `:param` form of `pattern` plus its `matchit` route.
fn translate(pattern: &str) -> Result<(String, String), RouteError> {
    let invalid = |reason: &str| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };
    let segments = split_path(pattern);
    let mut route = String::new();
    for (i, seg) in segments.iter().enumerate() {
        route.push('/');
        if let Some(name) = seg.strip_prefix('*') {
            if i + 1 != segments.len() {
                return Err(invalid("wildcard must be the last segment"));
            }
            if name.is_empty() {
                return Err(invalid("wildcard name is empty"));
            }
            route.push_str(&format!("{{*{name}}}"));
        } else if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter name is empty"));
            }
            route.push_str(&format!("{{{name}}}"));
        } else {
            route.push_str(&seg.replace('{', "{{").replace('}', "}}"));
        }
    }
    if route.is_empty() {
        route.push('/');
    }
    Ok((canonical(&segments), route))
}

/// First dynamic segment of `b` that sits where `a` has a dynamic segment of
/// the same kind but another name, both reached through the same prefix.
fn renamed_param(a: &str, b: &str) -> Option<(String, String)> {
    for (x, y) in split_path(a).into_iter().zip(split_path(b)) {
        let kind = |seg: &str| seg.chars().next().filter(|c| matches!(c, ':' | '*'));
        match (kind(x), kind(y)) {
            (None, None) if x == y => {}
            (Some(kx), Some(ky)) if kx == ky => {
                if x != y {
                    return Some((x.to_string(), y.to_string()));
                }
            }
            _ => return None,
        }
    }
    None
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn canonical(segments: &[&str]) -> String {
    format!("/{}", segments.join("/"))
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}
