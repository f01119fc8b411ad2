//! Request routing: maps a message uri and verb to the owning service.
//!
//! Every service owns the uri prefix `/service/{id}`; its routes are
//! registered as short uris below that prefix.

use std::collections::{BTreeSet, HashMap};

use http::Method;
use parking_lot::RwLock;
use relayhub_core::{Message, MessageType, RouteError, UriTrie};

use super::request::ServiceRequest;

pub const SERVICE_URI_ROOT: &str = "/service";

/// Uri prefix owned by service `id`.
#[must_use]
pub fn service_prefix(id: &str) -> String {
    format!("{SERVICE_URI_ROOT}/{id}")
}

/// The `http::Method` a request verb stands for.
#[must_use]
pub fn method_of(message_type: MessageType) -> Option<Method> {
    message_type
        .verb()
        .and_then(|verb| Method::from_bytes(verb.as_bytes()).ok())
}

/// Where a matched request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service_id: String,
    /// Short-uri pattern, relative to the service prefix.
    pub short_uri: String,
    pub method: Method,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("no service route matches {0}")]
    NotFound(String),
    #[error("{message_type} not allowed on {uri}")]
    MethodNotAllowed { uri: String, message_type: MessageType },
    #[error("{verb} {pattern} already registered")]
    Duplicate { verb: Method, pattern: String },
    #[error("{0} is not a request verb")]
    NotAVerb(MessageType),
    #[error(transparent)]
    Pattern(#[from] RouteError),
}

impl RouterError {
    /// Error response for a request that failed to route.
    #[must_use]
    pub fn to_response(&self, request: &Message) -> Message {
        let message_type = match self {
            Self::MethodNotAllowed { .. } | Self::NotAVerb(_) => MessageType::MethodNotAllowed,
            Self::NotFound(_) | Self::Duplicate { .. } | Self::Pattern(_) => MessageType::NotFound,
        };
        Message::error(request, message_type, self.to_string())
    }
}

struct PatternEntry {
    service_id: String,
    short_uri: String,
    methods: BTreeSet<String>,
}

#[derive(Default)]
struct Routes {
    trie: UriTrie<String>,
    entries: HashMap<String, PatternEntry>,
}

/// Uri trie over every registered service route.
#[derive(Default)]
pub struct ServiceRouter {
    routes: RwLock<Routes>,
}

impl ServiceRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `verb short_uri` for `service_id`.
    ///
    /// # Errors
    ///
    /// `Duplicate` for an already registered verb and pattern, `Pattern` for
    /// malformed patterns or a pattern owned by another service.
    pub fn register(&self, service_id: &str, verb: &Method, short_uri: &str) -> Result<(), RouterError> {
        let pattern = format!("{}{}", service_prefix(service_id), normalize_short_uri(short_uri));
        let mut routes = self.routes.write();

        if let Some(entry) = routes.entries.get_mut(&pattern) {
            if entry.service_id != service_id {
                return Err(RouteError::Duplicate(pattern).into());
            }
            if !entry.methods.insert(verb.as_str().to_string()) {
                return Err(RouterError::Duplicate {
                    verb: verb.clone(),
                    pattern,
                });
            }
            return Ok(());
        }

        routes.trie.add(&pattern, pattern.clone())?;
        routes.entries.insert(
            pattern,
            PatternEntry {
                service_id: service_id.to_string(),
                short_uri: normalize_short_uri(short_uri),
                methods: BTreeSet::from([verb.as_str().to_string()]),
            },
        );
        Ok(())
    }

    /// Removes every route of `service_id`, returning how many patterns
    /// were dropped.
    pub fn unregister_service(&self, service_id: &str) -> usize {
        let mut routes = self.routes.write();
        let patterns: Vec<String> = routes
            .entries
            .iter()
            .filter(|(_, e)| e.service_id == service_id)
            .map(|(p, _)| p.clone())
            .collect();
        for pattern in &patterns {
            routes.trie.remove(pattern);
            routes.entries.remove(pattern);
        }
        patterns.len()
    }

    /// Matches `request`, recording the match in its context.
    ///
    /// # Errors
    ///
    /// `NotFound` when no pattern matches, `MethodNotAllowed` when the
    /// pattern exists but not for this verb.
    pub fn route(&self, request: &ServiceRequest) -> Result<RouteTarget, RouterError> {
        let message = request.message();
        let method = method_of(message.message_type()).ok_or(RouterError::NotAVerb(message.message_type()))?;

        let routes = self.routes.read();
        let matched = routes
            .trie
            .match_uri(message.uri())
            .map_err(|_| RouterError::NotFound(message.uri().to_string()))?;
        let entry = routes
            .entries
            .get(&matched.handle)
            .ok_or_else(|| RouterError::NotFound(message.uri().to_string()))?;
        if !entry.methods.contains(method.as_str()) {
            return Err(RouterError::MethodNotAllowed {
                uri: message.uri().to_string(),
                message_type: message.message_type(),
            });
        }
        let target = RouteTarget {
            service_id: entry.service_id.clone(),
            short_uri: entry.short_uri.clone(),
            method,
        };
        drop(routes);

        request.update_context(|ctx| {
            ctx.uri_pattern = Some(matched.pattern);
            ctx.path_params = matched.path_params;
            ctx.query_params = matched.query_params;
        });
        Ok(target)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical form of a short uri: leading slash, no trailing slash.
pub(crate) fn normalize_short_uri(short_uri: &str) -> String {
    let trimmed = short_uri.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
