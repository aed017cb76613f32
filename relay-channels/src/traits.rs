use crate::types::{MessageId, OpenId};
use anyhow::Result;
use async_trait::async_trait;

/// Result of one send-text call. `code == 0` means the platform accepted the
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub code: i64,
    pub msg: String,
    pub message_id: Option<MessageId>,
}

impl SendReceipt {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a plain text message to one user, addressed by open id.
    ///
    /// `Err` means the call did not complete (transport or decoding failure);
    /// platform-level rejections come back as a receipt with a non-zero code.
    async fn send_text(&self, receive_id: &OpenId, text: &str) -> Result<SendReceipt>;
}
