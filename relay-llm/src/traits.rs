use crate::client::{FragmentStream, LlmClient};
use crate::error::Result;
use crate::types::{Balance, ChatMessage};
use async_trait::async_trait;

/// The operations the relay needs from an inference backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<FragmentStream>;

    async fn get_balance(&self) -> Result<Balance>;
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        LlmClient::complete(self, messages, temperature).await
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<FragmentStream> {
        LlmClient::complete_stream(self, messages, temperature).await
    }

    async fn get_balance(&self) -> Result<Balance> {
        LlmClient::get_balance(self).await
    }
}
