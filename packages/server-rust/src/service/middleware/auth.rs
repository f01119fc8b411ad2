//! Bearer credential resolution.
//!
//! The auth middleware reads `authorization: Bearer <token>`, resolves it to
//! a [`Principal`] and tags the request. It never rejects: services that
//! require a caller identity reject unauthorized requests at dispatch.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use quick_cache::sync::Cache;
use relayhub_core::{Principal, AUTHORIZATION_HEADER};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::pipeline::Middleware;
use crate::network::Connection;
use crate::service::config::AuthConfig;
use crate::service::request::ServiceRequest;

pub const AUTH_ID: &str = "auth";
pub const AUTH_PRIORITY: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("unknown token")]
    UnknownToken,
}

/// A principal plus the instant its credential stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub principal: Principal,
    pub expires_at: Option<SystemTime>,
}

impl Resolved {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= SystemTime::now())
    }
}

/// Maps a bearer token to the identity it stands for.
pub trait CredentialResolver: Send + Sync {
    /// # Errors
    ///
    /// `AuthError` when the token is malformed, expired or unknown.
    fn resolve(&self, token: &str) -> Result<Resolved, AuthError>;
}

// ---------------------------------------------------------------------------
// JwtResolver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    exp: u64,
}

/// HS256 JSON web tokens. `sub` becomes the principal id.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    #[must_use]
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl CredentialResolver for JwtResolver {
    fn resolve(&self, token: &str) -> Result<Resolved, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let claims = data.claims;
        Ok(Resolved {
            principal: Principal::new(claims.sub, claims.roles),
            expires_at: Some(UNIX_EPOCH + Duration::from_secs(claims.exp)),
        })
    }
}

// ---------------------------------------------------------------------------
// StaticTokenResolver
// ---------------------------------------------------------------------------

/// Opaque API tokens, compared in constant time.
#[derive(Default)]
pub struct StaticTokenResolver {
    tokens: Vec<(Vec<u8>, Principal)>,
}

impl StaticTokenResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.push((token.into().into_bytes(), principal));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CredentialResolver for StaticTokenResolver {
    fn resolve(&self, token: &str) -> Result<Resolved, AuthError> {
        let presented = token.as_bytes();
        let mut found = None;
        // No early exit: every entry is compared.
        for (stored, principal) in &self.tokens {
            if bool::from(presented.ct_eq(stored.as_slice())) && found.is_none() {
                found = Some(principal);
            }
        }
        found
            .map(|principal| Resolved {
                principal: principal.clone(),
                expires_at: None,
            })
            .ok_or(AuthError::UnknownToken)
    }
}

// ---------------------------------------------------------------------------
// AuthMiddleware
// ---------------------------------------------------------------------------

/// Extracts the token from an `authorization` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub struct AuthMiddleware {
    resolvers: Vec<Arc<dyn CredentialResolver>>,
    cache: Cache<String, Resolved>,
}

impl AuthMiddleware {
    #[must_use]
    pub fn new(resolvers: Vec<Arc<dyn CredentialResolver>>, cache_capacity: usize) -> Self {
        Self {
            resolvers,
            cache: Cache::new(cache_capacity.max(1)),
        }
    }

    /// Builds the resolvers named by `config`: JWT when a secret is set,
    /// then the static token table.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut resolvers: Vec<Arc<dyn CredentialResolver>> = Vec::new();
        if let Some(secret) = &config.jwt_secret {
            resolvers.push(Arc::new(JwtResolver::hs256(secret.as_bytes())));
        }
        let statics = config
            .static_tokens
            .iter()
            .fold(StaticTokenResolver::new(), |acc, t| {
                acc.with_token(t.token.clone(), Principal::new(t.principal_id.clone(), t.roles.clone()))
            });
        if !statics.is_empty() {
            resolvers.push(Arc::new(statics));
        }
        Self::new(resolvers, config.cache_capacity)
    }

    /// Resolves `token` through the cache, then each resolver in turn.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<Principal> {
        if let Some(hit) = self.cache.get(token) {
            if !hit.is_expired() {
                return Some(hit.principal);
            }
            self.cache.remove(token);
        }
        for resolver in &self.resolvers {
            match resolver.resolve(token) {
                Ok(resolved) if !resolved.is_expired() => {
                    let principal = resolved.principal.clone();
                    self.cache.insert(token.to_string(), resolved);
                    return Some(principal);
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "credential not accepted by resolver"),
            }
        }
        None
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn id(&self) -> &str {
        AUTH_ID
    }

    fn priority(&self) -> i32 {
        AUTH_PRIORITY
    }

    async fn run(&self, _conn: &dyn Connection, request: &ServiceRequest) {
        let principal = request
            .message()
            .header(AUTHORIZATION_HEADER)
            .and_then(bearer_token)
            .and_then(|token| self.authenticate(token));
        request.update_context(|ctx| {
            ctx.authorized = principal.is_some();
            ctx.principal = principal;
        });
    }
}
