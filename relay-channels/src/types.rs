use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(EventId);
id_newtype!(MessageId);
id_newtype!(OpenId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Other(String),
}

impl MessageType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Other(other) => other,
        }
    }
}

/// Sender descriptor as it appears across payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderPayload {
    /// `event.sender.sender_id.{open_id,user_id}`
    Nested {
        open_id: Option<String>,
        user_id: Option<String>,
    },
    /// `event.sender.{open_id,user_id}`
    Flat {
        open_id: Option<String>,
        user_id: Option<String>,
    },
    /// `event.user_id`
    Bare { user_id: String },
    Missing,
}

impl SenderPayload {
    /// Recipient identity, preferring the open id over the user id.
    pub fn resolve(&self) -> Option<OpenId> {
        let id = match self {
            Self::Nested { open_id, user_id } | Self::Flat { open_id, user_id } => {
                non_empty(open_id.as_deref()).or_else(|| non_empty(user_id.as_deref()))
            }
            Self::Bare { user_id } => non_empty(Some(user_id.as_str())),
            Self::Missing => None,
        };
        id.map(OpenId::from)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A received chat message, parsed once at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: Option<EventId>,
    pub message_id: Option<MessageId>,
    pub message_type: MessageType,
    /// JSON document carrying a `text` field for text messages.
    pub raw_content: String,
    pub sender: SenderPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    Empty,
    Malformed(String),
}

impl fmt::Display for ContentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty message content"),
            Self::Malformed(e) => write!(f, "malformed message content: {e}"),
        }
    }
}

impl std::error::Error for ContentError {}

#[derive(Debug, Deserialize)]
struct TextContent {
    #[serde(default)]
    text: Option<String>,
}

impl InboundEvent {
    /// Trimmed `text` of the content document. An absent `text` field yields
    /// an empty string.
    pub fn text(&self) -> Result<String, ContentError> {
        if self.raw_content.trim().is_empty() {
            return Err(ContentError::Empty);
        }
        let parsed: TextContent = serde_json::from_str(&self.raw_content)
            .map_err(|e| ContentError::Malformed(e.to_string()))?;
        Ok(parsed.text.unwrap_or_default().trim().to_string())
    }

    pub fn recipient(&self) -> Option<OpenId> {
        self.sender.resolve()
    }
}
