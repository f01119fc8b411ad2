//! The hub's single message envelope and its factories.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::MessageType;

/// Header carrying the caller's bearer credential.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Header carrying a human-readable failure reason on error responses.
pub const REASON_HEADER: &str = "reason";

/// A single unit of traffic between hub, callers and providers.
///
/// Requests and their responses share the same `id`, which is how a
/// connection correlates a response with the request awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    id: String,
    from: String,
    to: String,
    uri: String,
    message_type: MessageType,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl Message {
    /// Creates a message with a fresh random id.
    #[must_use]
    pub fn new(
        message_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        uri: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_id(new_message_id(), message_type, from, to, uri, payload)
    }

    /// Creates a message with an explicit id.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        message_type: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        uri: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            uri: uri.into(),
            message_type,
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Service request shorthand: `Message::request(MessageType::Get, "/service/echo/echo", b"hi")`.
    #[must_use]
    pub fn request(message_type: MessageType, uri: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(message_type, "", "", uri, payload)
    }

    #[must_use]
    pub fn ping(from: impl Into<String>) -> Self {
        Self::new(MessageType::Ping, from, "", "", Vec::new())
    }

    /// Pong answering `ping`; keeps the ping's id.
    #[must_use]
    pub fn pong(ping: &Message) -> Self {
        Self::with_id(ping.id.clone(), MessageType::Pong, ping.to.clone(), ping.from.clone(), "", Vec::new())
    }

    /// Ack for `message`; keeps its id.
    #[must_use]
    pub fn ack(message: &Message) -> Self {
        Self::with_id(message.id.clone(), MessageType::Ack, message.to.clone(), message.from.clone(), message.uri.clone(), Vec::new())
    }

    /// Successful (`Ok`) response to `request`.
    #[must_use]
    pub fn response(request: &Message, payload: impl Into<Vec<u8>>) -> Self {
        Self::response_with(request, MessageType::Ok, payload)
    }

    /// Response to `request` with an explicit response type.
    #[must_use]
    pub fn response_with(request: &Message, message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(
            request.id.clone(),
            message_type,
            request.to.clone(),
            request.from.clone(),
            request.uri.clone(),
            payload,
        )
    }

    /// Error response to `request`. The reason travels both as payload and
    /// in the `reason` header.
    #[must_use]
    pub fn error(request: &Message, message_type: MessageType, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut msg = Self::response_with(request, message_type, reason.clone().into_bytes());
        msg.headers.insert(REASON_HEADER.to_string(), reason);
        msg
    }

    #[must_use]
    pub fn not_found(request: &Message, reason: impl Into<String>) -> Self {
        Self::error(request, MessageType::NotFound, reason)
    }

    #[must_use]
    pub fn forbidden(request: &Message, reason: impl Into<String>) -> Self {
        Self::error(request, MessageType::Forbidden, reason)
    }

    #[must_use]
    pub fn unauthorized(request: &Message, reason: impl Into<String>) -> Self {
        Self::error(request, MessageType::Unauthorized, reason)
    }

    #[must_use]
    pub fn internal_error(request: &Message, reason: impl Into<String>) -> Self {
        Self::error(request, MessageType::InternalError, reason)
    }

    #[must_use]
    pub fn service_unavailable(request: &Message, reason: impl Into<String>) -> Self {
        Self::error(request, MessageType::ServiceUnavailable, reason)
    }

    // ----- accessors -----

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Failure reason of an error response, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.header(REASON_HEADER)
    }

    // ----- builders -----

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    #[must_use]
    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    /// Replaces the id, used when relaying a provider's response back under
    /// the original request id.
    #[must_use]
    pub fn with_new_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Generates a random message id.
#[must_use]
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Message {
        Message::with_id("req-1", MessageType::Get, "caller", "hub", "/service/echo/echo", b"hi".to_vec())
    }

    #[test]
    fn response_keeps_id_and_swaps_endpoints() {
        let resp = Message::response(&req(), b"hi".to_vec());
        assert_eq!(resp.id(), "req-1");
        assert_eq!(resp.from(), "hub");
        assert_eq!(resp.to(), "caller");
        assert_eq!(resp.message_type(), MessageType::Ok);
        assert_eq!(resp.payload(), b"hi");
    }

    #[test]
    fn error_carries_reason_header_and_payload() {
        let resp = Message::not_found(&req(), "no such service");
        assert_eq!(resp.message_type(), MessageType::NotFound);
        assert_eq!(resp.reason(), Some("no such service"));
        assert_eq!(resp.payload(), b"no such service");
    }

    #[test]
    fn pong_answers_ping() {
        let ping = Message::ping("client-a");
        let pong = Message::pong(&ping);
        assert_eq!(pong.id(), ping.id());
        assert_eq!(pong.message_type(), MessageType::Pong);
        assert_eq!(pong.to(), "client-a");
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Message::request(MessageType::Get, "/a", Vec::new());
        let b = Message::request(MessageType::Get, "/a", Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn headers_builder() {
        let msg = req().with_header(AUTHORIZATION_HEADER, "Bearer abc");
        assert_eq!(msg.header(AUTHORIZATION_HEADER), Some("Bearer abc"));
        assert_eq!(msg.header("missing"), None);
    }
}
