//! Ordered, short-circuiting request interceptors.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::network::Connection;
use crate::service::request::ServiceRequest;

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// A request interceptor.
///
/// A middleware annotates the request context, or ends the request early by
/// calling [`ServiceRequest::reject`] with the response the caller should
/// see. The pipeline stops as soon as the request is terminal.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable identifier, unique within a pipeline.
    fn id(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    async fn run(&self, conn: &dyn Connection, request: &ServiceRequest);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("middleware {0} already registered")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// MiddlewarePipeline
// ---------------------------------------------------------------------------

/// Middlewares in ascending priority; equal priorities keep registration
/// order.
#[derive(Default)]
pub struct MiddlewarePipeline {
    chain: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewarePipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `Duplicate` if a middleware with the same id is registered.
    pub fn register(&self, middleware: Arc<dyn Middleware>) -> Result<(), PipelineError> {
        let mut chain = self.chain.write();
        if chain.iter().any(|m| m.id() == middleware.id()) {
            return Err(PipelineError::Duplicate(middleware.id().to_string()));
        }
        let at = chain.partition_point(|m| m.priority() <= middleware.priority());
        debug!(middleware = middleware.id(), priority = middleware.priority(), "middleware registered");
        chain.insert(at, middleware);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<dyn Middleware>> {
        let mut chain = self.chain.write();
        let at = chain.iter().position(|m| m.id() == id)?;
        Some(chain.remove(at))
    }

    /// Ids in execution order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.chain.read().iter().map(|m| m.id().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }

    /// Runs the chain over `request`. Returns `true` if the request passed
    /// every middleware without being ended.
    pub async fn run(&self, conn: &dyn Connection, request: &ServiceRequest) -> bool {
        let chain: Vec<Arc<dyn Middleware>> = self.chain.read().clone();
        for middleware in chain {
            if request.is_terminal() {
                return false;
            }
            middleware.run(conn, request).await;
            if request.is_terminal() {
                debug!(
                    middleware = middleware.id(),
                    request = %request.id(),
                    status = ?request.status(),
                    "request stopped by middleware"
                );
                return false;
            }
        }
        !request.is_terminal()
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline").field("ids", &self.ids()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
