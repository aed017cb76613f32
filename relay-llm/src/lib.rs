//! Client for a DeepSeek-compatible inference API.
//!
//! Pure HTTP: chat completion (single-shot and SSE streaming) and the
//! account balance endpoint.

mod client;
mod error;
mod sse;
mod traits;
mod types;

pub use client::{DEFAULT_API_BASE, DEFAULT_MODEL, FragmentStream, LlmClient, LlmClientConfig};
pub use error::{LlmError, Result, describe_status};
pub use traits::CompletionBackend;
pub use types::{Balance, BalanceInfo, ChatMessage, Role, build_messages};
