//! Message envelope, type codes and wire codec.
//!
//! Every frame exchanged between callers, the hub and providers is a
//! [`Message`]. Its [`MessageType`] says whether it is a control frame, a
//! service-request verb or a response.

pub mod codec;
pub mod message;
pub mod message_type;

pub use codec::{decode, encode, CodecError};
pub use message::{new_message_id, Message, AUTHORIZATION_HEADER, REASON_HEADER};
pub use message_type::MessageType;
