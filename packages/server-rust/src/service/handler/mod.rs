//! Local route handlers as tower services.
//!
//! A handler is a `tower` service from `Arc<ServiceRequest>` to the response
//! [`Message`]. Every registered handler is wrapped by
//! [`build_handler_stack`]:
//!
//! - `tower`'s timeout: bounds handler run time
//! - [`instrument`]: `tracing` span with duration and outcome

pub mod instrument;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use relayhub_core::{Message, MessageType};
use tower::timeout::error::Elapsed;
use tower::util::BoxCloneService;
use tower::{BoxError, ServiceBuilder};

pub use instrument::InstrumentLayer;

use super::request::ServiceRequest;
use crate::network::connection::duration_ms;

/// Errors a handler may fail with. Each maps to an error response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("handler failed: {0}")]
    Failed(String),
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

impl HandlerError {
    /// The response type this error is reported with.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Timeout { .. } => MessageType::RequestTimeout,
            Self::BadRequest(_) => MessageType::BadRequest,
            Self::Forbidden(_) => MessageType::Forbidden,
            Self::NotFound(_) => MessageType::NotFound,
            Self::Failed(_) => MessageType::InternalError,
        }
    }

    /// Error response to `request`, carrying this error as the reason.
    #[must_use]
    pub fn to_response(&self, request: &Message) -> Message {
        Message::error(request, self.message_type(), self.to_string())
    }
}

/// A boxed, cloneable route handler.
pub type Handler = BoxCloneService<Arc<ServiceRequest>, Message, HandlerError>;

/// Wraps an async function as a [`Handler`].
///
/// Any `anyhow` error becomes `HandlerError::Failed`.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<ServiceRequest>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = anyhow::Result<Message>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(move |request: Arc<ServiceRequest>| {
        let fut = f(request);
        async move { fut.await.map_err(HandlerError::from) }
    }))
}

/// Layers timeout and instrumentation around `handler`.
///
/// Order (outermost first): error mapping, `tower`'s timeout, then
/// `InstrumentLayer`. The span covers the handler alone.
#[must_use]
pub fn build_handler_stack(service_id: &str, handler: Handler, timeout: Duration) -> Handler {
    BoxCloneService::new(
        ServiceBuilder::new()
            .map_err(move |e: BoxError| from_box_error(e, timeout))
            .timeout(timeout)
            .layer(InstrumentLayer::new(service_id))
            .service(handler),
    )
}

/// Recovers the handler's own error, or reports an elapsed timeout.
fn from_box_error(e: BoxError, timeout: Duration) -> HandlerError {
    if e.is::<Elapsed>() {
        return HandlerError::Timeout {
            timeout_ms: duration_ms(timeout),
        };
    }
    match e.downcast::<HandlerError>() {
        Ok(e) => *e,
        Err(e) => HandlerError::Failed(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;

    fn request(payload: &[u8]) -> Arc<ServiceRequest> {
        Arc::new(ServiceRequest::new(Message::request(
            MessageType::Post,
            "/service/s/echo",
            payload.to_vec(),
        )))
    }

    #[tokio::test]
    async fn stack_runs_handler() {
        let echo = handler_fn(|req: Arc<ServiceRequest>| async move {
            Ok(Message::response(req.message(), req.message().payload().to_vec()))
        });
        let svc = build_handler_stack("s", echo, Duration::from_secs(1));
        let resp = svc.oneshot(request(b"hi")).await.unwrap();
        assert_eq!(resp.payload(), b"hi");
    }

    #[tokio::test(start_paused = true)]
    async fn stack_applies_timeout() {
        let slow = handler_fn(|req: Arc<ServiceRequest>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Message::response(req.message(), Vec::new()))
        });
        let svc = build_handler_stack("s", slow, Duration::from_millis(20));
        let err = svc.oneshot(request(b"")).await.unwrap_err();
        assert_eq!(err, HandlerError::Timeout { timeout_ms: 20 });
        assert_eq!(err.message_type(), MessageType::RequestTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn stack_keeps_handler_errors_and_fast_responses() {
        let missing: Handler = BoxCloneService::new(tower::service_fn(|_req: Arc<ServiceRequest>| async {
            Err::<Message, _>(HandlerError::NotFound("no such item".into()))
        }));
        let svc = build_handler_stack("s", missing, Duration::from_secs(1));
        let err = svc.oneshot(request(b"")).await.unwrap_err();
        assert_eq!(err, HandlerError::NotFound("no such item".into()));

        let quick = handler_fn(|req: Arc<ServiceRequest>| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Message::response(req.message(), Vec::new()))
        });
        let svc = build_handler_stack("s", quick, Duration::from_millis(1_000));
        assert_eq!(svc.oneshot(request(b"")).await.unwrap().message_type(), MessageType::Ok);
    }

    #[tokio::test]
    async fn anyhow_errors_become_internal_errors() {
        let failing = handler_fn(|_req: Arc<ServiceRequest>| async move {
            Err::<Message, _>(anyhow::anyhow!("database unreachable"))
        });
        let req = request(b"");
        let err = failing.oneshot(Arc::clone(&req)).await.unwrap_err();
        let resp = err.to_response(req.message());
        assert_eq!(resp.message_type(), MessageType::InternalError);
        assert_eq!(resp.id(), req.id());
        assert!(resp.reason().unwrap().contains("database unreachable"));
    }
}
