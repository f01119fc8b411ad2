//! A single in-flight request and its lifecycle.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use relayhub_core::{Message, RequestContext};
use tracing::debug;

use crate::pool::StatefulBarrier;

/// Request lifecycle.
///
/// `Queued -> Processing -> {Dead, Finished, Cancelled}`, plus the direct
/// `Queued -> {Dead, Finished, Cancelled}` short-cuts. Terminal states never
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    Queued = 0,
    Processing = 1,
    Dead = 2,
    Finished = 3,
    Cancelled = 4,
}

impl RequestStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Dead | Self::Finished | Self::Cancelled)
    }

    /// The one table of legal transitions.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use RequestStatus::{Cancelled, Dead, Finished, Processing, Queued};
        matches!(
            (self, next),
            (Queued, Processing | Dead | Finished | Cancelled) | (Processing, Dead | Finished | Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request {id} is {status:?}, not Processing")]
    NotProcessing { id: String, status: RequestStatus },
    #[error("request {id} is {status:?}, not Queued")]
    NotQueued { id: String, status: RequestStatus },
    #[error("request {id} already ended as {status:?}")]
    AlreadyTerminal { id: String, status: RequestStatus },
    #[error("illegal transition {from:?} -> {to:?} for request {id}")]
    IllegalTransition {
        id: String,
        from: RequestStatus,
        to: RequestStatus,
    },
}

/// One inbound message on its way through the hub.
///
/// The response handle is a one-shot barrier: `Some(message)` when the
/// request finished with a response, `None` when it was killed or
/// cancelled.
pub struct ServiceRequest {
    message: Message,
    status: Mutex<RequestStatus>,
    context: RwLock<RequestContext>,
    response: StatefulBarrier<Option<Message>>,
    created_at: Instant,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            status: Mutex::new(RequestStatus::Queued),
            context: RwLock::new(RequestContext::default()),
            response: StatefulBarrier::new(),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.message.id()
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> RequestStatus {
        *self.status.lock()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Marks the request dead and releases its caller without a response.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminal` if the request has already ended.
    pub fn kill(&self) -> Result<(), RequestError> {
        self.end(RequestStatus::Dead, None)
    }

    /// Marks the request cancelled and releases its caller without a
    /// response.
    ///
    /// # Errors
    ///
    /// `AlreadyTerminal` if the request has already ended.
    pub fn cancel(&self) -> Result<(), RequestError> {
        self.end(RequestStatus::Cancelled, None)
    }

    fn end(&self, to: RequestStatus, response: Option<Message>) -> Result<(), RequestError> {
        self.transition(|from| self.not_terminal(from), to, response)
    }

    /// Finishes a processing request with `message`.
    ///
    /// # Errors
    ///
    /// `NotProcessing` in any other state; the stored response is left
    /// untouched.
    pub fn resolve(&self, message: Message) -> Result<(), RequestError> {
        self.transition(
            |from| {
                if from == RequestStatus::Processing {
                    Ok(())
                } else {
                    Err(RequestError::NotProcessing {
                        id: self.id().to_string(),
                        status: from,
                    })
                }
            },
            RequestStatus::Finished,
            Some(message),
        )
    }

    /// Finishes a request that was never admitted, answering with
    /// `message`. Used by routing and middlewares to short-circuit.
    ///
    /// # Errors
    ///
    /// `NotQueued` once the request has been admitted or has ended.
    pub fn reject(&self, message: Message) -> Result<(), RequestError> {
        self.transition(
            |from| {
                if from == RequestStatus::Queued {
                    Ok(())
                } else {
                    Err(RequestError::NotQueued {
                        id: self.id().to_string(),
                        status: from,
                    })
                }
            },
            RequestStatus::Finished,
            Some(message),
        )
    }

    /// Moves the request to `to`.
    ///
    /// An illegal transition on a live request kills it before the error is
    /// returned.
    pub(crate) fn transit_status(&self, to: RequestStatus) -> Result<(), RequestError> {
        match self.transition(|from| self.not_terminal(from), to, None) {
            Err(RequestError::IllegalTransition { id, from, to }) => {
                // Queued and Processing may always die.
                let _ = self.transition(|_| Ok(()), RequestStatus::Dead, None);
                debug!(request = %id, ?from, ?to, "illegal transition, request killed");
                Err(RequestError::IllegalTransition { id, from, to })
            }
            other => other,
        }
    }

    fn not_terminal(&self, from: RequestStatus) -> Result<(), RequestError> {
        if from.is_terminal() {
            Err(RequestError::AlreadyTerminal {
                id: self.id().to_string(),
                status: from,
            })
        } else {
            Ok(())
        }
    }

    /// Every status change goes through here: `check` vets the current
    /// status, then [`RequestStatus::can_transition_to`] decides. Entering a
    /// terminal status opens the response barrier with `response`.
    fn transition(
        &self,
        check: impl FnOnce(RequestStatus) -> Result<(), RequestError>,
        to: RequestStatus,
        response: Option<Message>,
    ) -> Result<(), RequestError> {
        let mut status = self.status.lock();
        let from = *status;
        check(from)?;
        if !from.can_transition_to(to) {
            return Err(RequestError::IllegalTransition {
                id: self.id().to_string(),
                from,
                to,
            });
        }
        *status = to;
        if to.is_terminal() {
            self.response.open_with(response);
        }
        Ok(())
    }

    /// Waits for the outcome.
    pub async fn response(&self) -> Option<Message> {
        self.response.get().await.clone()
    }

    /// Waits at most `timeout`; on expiry the request is killed so a late
    /// `resolve` cannot revive it.
    pub async fn response_timeout(&self, timeout: Duration) -> Option<Message> {
        if !self.response.wait_timeout(timeout).await && self.kill().is_ok() {
            debug!(request = %self.id(), timeout_ms = timeout.as_millis(), "request timed out");
        }
        // Either our kill landed or a resolve beat it; the barrier is open.
        self.response.try_get().cloned().flatten()
    }

    /// The response barrier, shared with the awaiting caller.
    #[must_use]
    pub fn response_barrier(&self) -> &StatefulBarrier<Option<Message>> {
        &self.response
    }

    #[must_use]
    pub fn context(&self) -> RequestContext {
        self.context.read().clone()
    }

    pub fn update_context<F>(&self, f: F)
    where
        F: FnOnce(&mut RequestContext),
    {
        f(&mut self.context.write());
    }

    /// Runs `f` against the context without cloning it.
    pub fn with_context<R>(&self, f: impl FnOnce(&RequestContext) -> R) -> R {
        f(&self.context.read())
    }
}

impl std::fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("id", &self.id())
            .field("uri", &self.message.uri())
            .field("type", &self.message.message_type())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relayhub_core::MessageType;

    use super::*;

    fn request() -> ServiceRequest {
        ServiceRequest::new(Message::request(MessageType::Get, "/service/echo/echo", b"hi".to_vec()))
    }

    #[test]
    fn transition_table() {
        use RequestStatus::*;
        let all = [Queued, Processing, Dead, Finished, Cancelled];
        for from in all {
            for to in all {
                let expected = match from {
                    Queued => to != Queued,
                    Processing => to.is_terminal(),
                    _ => false,
                };
                assert_eq!(from.can_transition_to(to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[tokio::test]
    async fn resolve_requires_processing() {
        let req = request();
        let reply = Message::response(req.message(), b"hi".to_vec());

        let err = req.resolve(reply.clone()).unwrap_err();
        assert!(matches!(err, RequestError::NotProcessing { status: RequestStatus::Queued, .. }));
        assert!(!req.response_barrier().is_open());

        req.transit_status(RequestStatus::Processing).unwrap();
        req.resolve(reply.clone()).unwrap();
        assert_eq!(req.status(), RequestStatus::Finished);
        assert_eq!(req.response().await, Some(reply.clone()));

        // A second resolve leaves the first response in place.
        let other = Message::response(req.message(), b"other".to_vec());
        assert!(req.resolve(other).is_err());
        assert_eq!(req.response().await, Some(reply));
    }

    #[tokio::test]
    async fn kill_and_cancel_release_without_payload() {
        let req = request();
        req.kill().unwrap();
        assert_eq!(req.status(), RequestStatus::Dead);
        assert_eq!(req.response().await, None);
        assert!(matches!(req.cancel(), Err(RequestError::AlreadyTerminal { .. })));

        let req = request();
        req.transit_status(RequestStatus::Processing).unwrap();
        req.cancel().unwrap();
        assert_eq!(req.status(), RequestStatus::Cancelled);
        assert_eq!(req.response().await, None);
    }

    #[tokio::test]
    async fn finished_request_refuses_kill_and_cancel() {
        let req = request();
        req.transit_status(RequestStatus::Processing).unwrap();
        let reply = Message::response(req.message(), b"done".to_vec());
        req.resolve(reply.clone()).unwrap();

        assert_eq!(
            req.kill(),
            Err(RequestError::AlreadyTerminal {
                id: req.id().to_string(),
                status: RequestStatus::Finished,
            })
        );
        assert_eq!(
            req.cancel(),
            Err(RequestError::AlreadyTerminal {
                id: req.id().to_string(),
                status: RequestStatus::Finished,
            })
        );
        assert_eq!(req.status(), RequestStatus::Finished);
        assert_eq!(req.response().await, Some(reply));
    }

    #[tokio::test]
    async fn reject_only_before_admission() {
        let req = request();
        let forbidden = Message::forbidden(req.message(), "blocked");
        req.reject(forbidden.clone()).unwrap();
        assert_eq!(req.status(), RequestStatus::Finished);
        assert_eq!(req.response().await, Some(forbidden));

        let req = request();
        req.transit_status(RequestStatus::Processing).unwrap();
        let err = req.reject(Message::forbidden(req.message(), "late")).unwrap_err();
        assert!(matches!(err, RequestError::NotQueued { .. }));
        assert_eq!(req.status(), RequestStatus::Processing);
    }

    #[tokio::test]
    async fn illegal_transition_kills_live_request() {
        let req = request();
        req.transit_status(RequestStatus::Processing).unwrap();
        let err = req.transit_status(RequestStatus::Queued).unwrap_err();
        assert!(matches!(err, RequestError::IllegalTransition { .. }));
        assert_eq!(req.status(), RequestStatus::Dead);
        assert_eq!(req.response().await, None);

        // Terminal states are left alone.
        assert!(matches!(
            req.transit_status(RequestStatus::Processing),
            Err(RequestError::AlreadyTerminal { status: RequestStatus::Dead, .. })
        ));
        assert_eq!(req.status(), RequestStatus::Dead);
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_kills_and_late_resolve_fails() {
        let req = request();
        req.transit_status(RequestStatus::Processing).unwrap();
        assert_eq!(req.response_timeout(Duration::from_millis(100)).await, None);
        assert_eq!(req.status(), RequestStatus::Dead);
        assert!(req.resolve(Message::response(req.message(), Vec::new())).is_err());
        assert_eq!(req.response().await, None);
    }

    #[tokio::test]
    async fn concurrent_resolve_and_kill_settle_once() {
        let req = Arc::new(request());
        req.transit_status(RequestStatus::Processing).unwrap();
        let reply = Message::response(req.message(), b"hi".to_vec());

        let a = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.resolve(reply).is_ok() })
        };
        let b = {
            let req = Arc::clone(&req);
            tokio::spawn(async move { req.kill().is_ok() })
        };
        let resolved = a.await.unwrap();
        let killed = b.await.unwrap();
        assert!(resolved ^ killed);
        match req.status() {
            RequestStatus::Finished => assert!(req.response().await.is_some()),
            RequestStatus::Dead => assert!(req.response().await.is_none()),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn context_updates_are_visible() {
        let req = request();
        req.update_context(|ctx| {
            ctx.source_addr = Some("10.0.0.9".into());
            ctx.attributes.insert("k".into(), "v".into());
        });
        assert_eq!(req.context().source_addr.as_deref(), Some("10.0.0.9"));
        assert_eq!(req.with_context(|ctx| ctx.attribute("k").map(str::to_string)), Some("v".into()));
    }
}
