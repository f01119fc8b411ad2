//! Instrumentation layer for route handlers.
//!
//! Wraps each handler call in a `tracing` span recording the service,
//! request id, duration and outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use relayhub_core::Message;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::HandlerError;
use crate::service::request::ServiceRequest;

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    service: Arc<str>,
}

impl InstrumentLayer {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: Arc::from(service.into()),
        }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService {
            inner,
            service: Arc::clone(&self.service),
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
    service: Arc<str>,
}

impl<S> Service<Arc<ServiceRequest>> for InstrumentService<S>
where
    S: Service<Arc<ServiceRequest>, Response = Message, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Message;
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<Message, HandlerError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Arc<ServiceRequest>) -> Self::Future {
        let span = info_span!(
            "handler",
            service = %self.service,
            request = %request.id(),
            uri = %request.message().uri(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let service = Arc::clone(&self.service);
        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(HandlerError::Timeout { .. }) => "timeout",
                    Err(_) => "error",
                };
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                tracing::debug!(service = %service, duration_ms, outcome, "handler complete");
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
