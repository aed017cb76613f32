use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation. This is also the persisted shape of a
/// context entry: `{"role": "user", "content": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Prior context followed by the new user turn.
pub fn build_messages(context: &[ChatMessage], user_msg: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.extend_from_slice(context);
    messages.push(ChatMessage::user(user_msg));
    messages
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInfo {
    #[serde(default = "unknown_currency")]
    pub currency: String,
    #[serde(default = "zero_amount")]
    pub total_balance: String,
    #[serde(default = "zero_amount")]
    pub granted_balance: String,
    #[serde(default = "zero_amount")]
    pub topped_up_balance: String,
}

fn unknown_currency() -> String {
    "未知货币".to_string()
}

fn zero_amount() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub is_available: bool,
    #[serde(default)]
    pub balance_infos: Vec<BalanceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_messages_appends_user_turn_after_context() {
        let context = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let messages = build_messages(&context, "next");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], ChatMessage::user("next"));
        assert_eq!(messages[..2], context[..]);
    }

    #[test]
    fn balance_missing_fields_fall_back_to_defaults() {
        let balance: Balance =
            serde_json::from_str(r#"{"balance_infos":[{"currency":"USD"}]}"#).expect("parse");
        assert!(!balance.is_available);
        assert_eq!(balance.balance_infos[0].total_balance, "0");
        assert_eq!(balance.balance_infos[0].topped_up_balance, "0");
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("x")).expect("serialize");
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }
}
