//! Feishu (Lark) boundary for the relay.
//!
//! Inbound callbacks are parsed once into [`InboundEvent`]; outbound text goes
//! through a [`MessageSender`].

mod crypto;
mod event;
mod feishu;
mod signature;
mod traits;
mod types;

pub use crypto::decrypt_payload;
pub use event::{Callback, MESSAGE_RECEIVE_V2, ParsedCallback, parse_callback};
pub use feishu::{DEFAULT_BASE_URL, FeishuClient};
pub use signature::{compute_signature, verify_signature, verify_token};
pub use traits::{MessageSender, SendReceipt};
pub use types::{
    ContentError, EventId, InboundEvent, MessageId, MessageType, OpenId, SenderPayload,
};
