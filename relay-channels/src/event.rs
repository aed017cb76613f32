//! Callback payload parsing.
//!
//! Both the v2 (`schema: "2.0"`, `header` + `event`) and the legacy v1
//! (`uuid` + `event`) envelopes are accepted and normalized into
//! [`InboundEvent`]. Encrypted envelopes are opened first.

use crate::crypto::decrypt_payload;
use crate::types::{EventId, InboundEvent, MessageId, MessageType, SenderPayload};
use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub const MESSAGE_RECEIVE_V2: &str = "im.message.receive_v1";
const MESSAGE_RECEIVE_V1: &str = "message";
const URL_VERIFICATION: &str = "url_verification";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    /// Endpoint ownership handshake; answer with the challenge.
    UrlVerification { challenge: String },
    MessageReceived(InboundEvent),
    /// Any other event type; acknowledged without processing.
    Ignored { event_type: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCallback {
    /// Verification token carried by the payload, if any.
    pub token: Option<String>,
    pub callback: Callback,
}

#[derive(Debug, Default, Deserialize)]
struct RawCallback {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    encrypt: Option<String>,
    #[serde(default)]
    header: Option<RawHeader>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    event: Option<RawEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeader {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    sender: Option<RawSender>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    user_id: Option<String>,
    // v1 message fields
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    open_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSender {
    #[serde(default)]
    sender_id: Option<RawSenderId>,
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSenderId {
    #[serde(default)]
    open_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// `encrypt_key` is only consulted for `{"encrypt": ..}` bodies.
pub fn parse_callback(body: &[u8], encrypt_key: &str) -> Result<ParsedCallback> {
    let mut raw: RawCallback = serde_json::from_slice(body).context("parse callback body")?;

    if let Some(encrypted) = raw.encrypt.take() {
        let plaintext = decrypt_payload(encrypt_key, &encrypted)?;
        raw = serde_json::from_slice(&plaintext).context("parse decrypted callback")?;
        if raw.encrypt.is_some() {
            bail!("decrypted callback is itself encrypted");
        }
    }

    let token = raw
        .header
        .as_ref()
        .and_then(|h| h.token.clone())
        .or_else(|| raw.token.clone());

    if raw.kind.as_deref() == Some(URL_VERIFICATION) {
        let challenge = raw
            .challenge
            .clone()
            .context("url_verification payload without challenge")?;
        return Ok(ParsedCallback {
            token,
            callback: Callback::UrlVerification { challenge },
        });
    }

    let event_type = raw
        .header
        .as_ref()
        .and_then(|h| h.event_type.clone())
        .or_else(|| raw.event.as_ref().and_then(|e| e.kind.clone()));

    let callback = match event_type.as_deref() {
        Some(MESSAGE_RECEIVE_V2) | Some(MESSAGE_RECEIVE_V1) => {
            Callback::MessageReceived(into_inbound_event(raw))
        }
        _ => Callback::Ignored { event_type },
    };
    Ok(ParsedCallback { token, callback })
}

fn into_inbound_event(raw: RawCallback) -> InboundEvent {
    let event = raw.event.unwrap_or_default();
    let message = event.message.unwrap_or_default();

    let explicit_id = raw.header.and_then(|h| h.event_id).or(event.event_id);
    let top_level_id = raw.event_id.or(raw.uuid);
    let embedded_id = message
        .message_id
        .clone()
        .or_else(|| event.open_message_id.clone());
    let event_id = [explicit_id, top_level_id, embedded_id.clone()]
        .into_iter()
        .flatten()
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
        .map(EventId::from);

    let sender = match event.sender {
        Some(RawSender {
            sender_id: Some(id),
            ..
        }) => SenderPayload::Nested {
            open_id: id.open_id,
            user_id: id.user_id,
        },
        Some(sender) => SenderPayload::Flat {
            open_id: sender.open_id,
            user_id: sender.user_id,
        },
        None => match event.user_id {
            Some(user_id) => SenderPayload::Bare { user_id },
            None => SenderPayload::Missing,
        },
    };

    // v1 carries the text inline; rebuild the v2 content document.
    let (message_type, raw_content) = match (message.message_type, event.msg_type) {
        (Some(message_type), _) => (message_type, message.content.unwrap_or_default()),
        (None, Some(msg_type)) => {
            let content = event
                .text
                .map(|text| serde_json::json!({ "text": text }).to_string())
                .unwrap_or_default();
            (msg_type, content)
        }
        (None, None) => (String::new(), message.content.unwrap_or_default()),
    };

    InboundEvent {
        event_id,
        message_id: embedded_id.map(MessageId::from),
        message_type: MessageType::parse(&message_type),
        raw_content,
        sender,
    }
}
