//! Routes a user message to a command handler or to plain chat.
//!
//! The dispatcher only decides what to say. Sending is the delivery engine's
//! job.

use crate::context::ContextManager;
use crate::kv::KvStore;
use relay_channels::{EventId, OpenId};
use relay_llm::{Balance, ChatMessage, CompletionBackend, FragmentStream, LlmError, build_messages};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TEMPERATURE: f32 = 0.3;
const ERROR_RECORD_TTL: Duration = Duration::from_secs(86_400);

pub const SERVICE_UNAVAILABLE: &str = "服务暂时不可用，请稍后再试";
pub const CONTEXT_CLEARED: &str = "🧹对话上下文已清除";
pub const CLEAR_WITHOUT_SENDER: &str = "无法获取用户信息，清除上下文失败";

pub const HELP_TEXT: &str = "🤖 机器人指令说明\n\n\
📌 查询余额\n   指令: /查询余额\n   功能: 查询DeepSeek API账户余额\n\n\
📌 清除上下文\n   指令: /清除上下文\n   功能: 清除当前对话的上下文历史\n\n\
📌 帮助\n   指令: /帮助 或 /help 或 /指定\n   功能: 查看所有可用指令说明\n\n\
💡 提示: 直接发送消息即可进行正常对话，机器人会自动维护上下文";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Balance,
    ClearContext,
    Help,
    Chat,
}

impl Command {
    /// Checks run in priority order; the first match wins.
    pub fn classify(user_msg: &str) -> Self {
        let msg = user_msg.trim();
        if msg == "查询余额" || msg.starts_with("/查询余额") {
            Self::Balance
        } else if msg.starts_with("/清除上下文") {
            Self::ClearContext
        } else if ["/帮助", "/help", "/指定"]
            .iter()
            .any(|prefix| msg.starts_with(prefix))
        {
            Self::Help
        } else {
            Self::Chat
        }
    }
}

pub enum Reply {
    Text(String),
    /// Model output forwarded fragment by fragment.
    Stream(FragmentStream),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl Reply {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Stream(_) => None,
        }
    }
}

pub fn format_balance(balance: &Balance) -> String {
    let status = if balance.is_available {
        "有可用余额"
    } else {
        "无可用余额"
    };
    let mut reply = format!("账户余额状态: {status}\n");
    if balance.balance_infos.is_empty() {
        reply.push_str("暂无余额详情");
        return reply;
    }
    reply.push_str("余额详情:\n");
    for info in &balance.balance_infos {
        let currency = &info.currency;
        reply.push_str(&format!("- 货币类型: {currency}\n"));
        reply.push_str(&format!("- 总余额: {} {currency}\n", info.total_balance));
        reply.push_str(&format!("- 赠额余额: {} {currency}\n", info.granted_balance));
        reply.push_str(&format!("- 充值余额: {} {currency}\n", info.topped_up_balance));
    }
    reply
}

/// Diagnostic record written when plain chat fails. Never read back.
#[derive(Debug, Serialize)]
struct ErrorEventRecord<'a> {
    timestamp: String,
    error_type: &'a str,
    error_message: String,
    user_id: &'a str,
    user_msg: &'a str,
}

pub fn error_key(event_id: &EventId) -> String {
    format!("error:event:{event_id}")
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn CompletionBackend>,
    contexts: ContextManager,
    store: Arc<dyn KvStore>,
    temperature: f32,
    stream_replies: bool,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn CompletionBackend>, store: Arc<dyn KvStore>) -> Self {
        Self {
            backend,
            contexts: ContextManager::new(store.clone()),
            store,
            temperature: DEFAULT_TEMPERATURE,
            stream_replies: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stream_replies(mut self, stream_replies: bool) -> Self {
        self.stream_replies = stream_replies;
        self
    }

    #[tracing::instrument(level = "info", skip_all, fields(event_id = ?event_id.map(EventId::as_str)))]
    pub async fn dispatch(
        &self,
        event_id: Option<&EventId>,
        user_msg: &str,
        sender: Option<&OpenId>,
    ) -> Option<Reply> {
        let user_msg = user_msg.trim();
        let command = Command::classify(user_msg);
        tracing::debug!(?command, "dispatching message");
        match command {
            Command::Balance => Some(Reply::Text(self.balance().await)),
            Command::ClearContext => Some(Reply::Text(self.clear_context(sender).await)),
            Command::Help => Some(Reply::Text(HELP_TEXT.to_string())),
            Command::Chat => {
                let Some(sender) = sender else {
                    tracing::warn!("chat message without resolvable sender; no reply");
                    return None;
                };
                self.chat(event_id, user_msg, sender).await
            }
        }
    }

    async fn balance(&self) -> String {
        match self.backend.get_balance().await {
            Ok(balance) => format_balance(&balance),
            Err(e) => {
                tracing::warn!(%e, "balance query failed");
                format!("查询余额失败: {e}")
            }
        }
    }

    async fn clear_context(&self, sender: Option<&OpenId>) -> String {
        let Some(sender) = sender else {
            return CLEAR_WITHOUT_SENDER.to_string();
        };
        match self.contexts.clear(sender).await {
            Ok(()) => CONTEXT_CLEARED.to_string(),
            Err(e) => {
                tracing::warn!(%e, user_id = %sender, "failed to clear context");
                format!("清除上下文失败: {e}")
            }
        }
    }

    async fn chat(
        &self,
        event_id: Option<&EventId>,
        user_msg: &str,
        sender: &OpenId,
    ) -> Option<Reply> {
        let prior = self.contexts.load(sender).await;
        let messages = build_messages(&prior, user_msg);

        if self.stream_replies {
            return match self
                .backend
                .complete_stream(&messages, self.temperature)
                .await
            {
                Ok(fragments) => {
                    self.save_turn(sender, &prior, user_msg).await;
                    Some(Reply::Stream(fragments))
                }
                Err(e) => Some(self.chat_failed(event_id, &e, sender, user_msg).await),
            };
        }

        match self.backend.complete(&messages, self.temperature).await {
            Ok(output) if output.trim().is_empty() => {
                tracing::warn!(user_id = %sender, "model returned empty output; no reply");
                None
            }
            Ok(output) => {
                self.save_turn(sender, &prior, user_msg).await;
                Some(Reply::Text(output))
            }
            Err(e) => Some(self.chat_failed(event_id, &e, sender, user_msg).await),
        }
    }

    async fn save_turn(&self, sender: &OpenId, prior: &[ChatMessage], user_msg: &str) {
        if let Err(e) = self.contexts.append_and_save(sender, prior, user_msg).await {
            tracing::error!(%e, user_id = %sender, "failed to save context");
        }
    }

    async fn chat_failed(
        &self,
        event_id: Option<&EventId>,
        error: &LlmError,
        sender: &OpenId,
        user_msg: &str,
    ) -> Reply {
        tracing::error!(%error, kind = error.kind(), user_id = %sender, "chat completion failed");
        if let Some(event_id) = event_id {
            self.record_error(event_id, error, sender, user_msg).await;
        }
        Reply::Text(SERVICE_UNAVAILABLE.to_string())
    }

    async fn record_error(
        &self,
        event_id: &EventId,
        error: &LlmError,
        sender: &OpenId,
        user_msg: &str,
    ) {
        let record = ErrorEventRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            error_type: error.kind(),
            error_message: error.to_string(),
            user_id: sender.as_str(),
            user_msg,
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(%e, "failed to encode error record");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_ex(&error_key(event_id), &encoded, ERROR_RECORD_TTL)
            .await
        {
            tracing::error!(%e, %event_id, "failed to record error event");
        }
    }
}
