//! Message type codes.
//!
//! Codes partition into three families: control frames (ping/pong/ack),
//! service-request verbs (one per HTTP method) and response codes whose
//! numeric values mirror HTTP status semantics.

use serde::{Deserialize, Serialize};

/// Discriminant carried by every [`Message`](super::Message).
///
/// Serialized as its numeric code (`u16`) so the wire format stays stable
/// regardless of variant naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum MessageType {
    // ----- control -----
    Ping,
    Pong,
    Ack,

    // ----- service-request verbs -----
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,

    // ----- responses -----
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    InternalError,
    ServiceUnavailable,
}

impl MessageType {
    /// Every variant, in code order.
    pub const ALL: [MessageType; 19] = [
        Self::Ping,
        Self::Pong,
        Self::Ack,
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Patch,
        Self::Delete,
        Self::Options,
        Self::Head,
        Self::Ok,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::MethodNotAllowed,
        Self::RequestTimeout,
        Self::InternalError,
        Self::ServiceUnavailable,
    ];

    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ping => 1,
            Self::Pong => 2,
            Self::Ack => 3,
            Self::Get => 10,
            Self::Post => 11,
            Self::Put => 12,
            Self::Patch => 13,
            Self::Delete => 14,
            Self::Options => 15,
            Self::Head => 16,
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::RequestTimeout => 408,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Reverse of [`code`](Self::code).
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Ping, pong and ack frames.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Ack)
    }

    /// Service-request verbs.
    #[must_use]
    pub const fn is_request(self) -> bool {
        let code = self.code();
        code >= 10 && code < 100
    }

    /// Any response code (success or error).
    #[must_use]
    pub const fn is_response(self) -> bool {
        self.code() >= 200
    }

    /// 2xx family.
    #[must_use]
    pub const fn is_success(self) -> bool {
        let code = self.code();
        code >= 200 && code < 300
    }

    /// 4xx and 5xx families.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.code() >= 400
    }

    /// Upper-case verb name for request types, `None` otherwise.
    #[must_use]
    pub const fn verb(self) -> Option<&'static str> {
        match self {
            Self::Get => Some("GET"),
            Self::Post => Some("POST"),
            Self::Put => Some("PUT"),
            Self::Patch => Some("PATCH"),
            Self::Delete => Some("DELETE"),
            Self::Options => Some("OPTIONS"),
            Self::Head => Some("HEAD"),
            _ => None,
        }
    }

    /// Parses an upper- or lower-case verb name.
    #[must_use]
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value.code()
    }
}

impl TryFrom<u16> for MessageType {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_code(value).ok_or_else(|| format!("unknown message type code {value}"))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.verb() {
            Some(verb) => f.write_str(verb),
            None => write!(f, "{self:?}({})", self.code()),
        }
    }
}
