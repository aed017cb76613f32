use crate::error::{LlmError, Result};
use crate::sse::{Frame, SseEvent, decode_sse, interpret_frame};
use crate::types::{Balance, ChatMessage};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-reasoner";

const COMPLETIONS_PATH: &str = "/chat/completions";
const BALANCE_PATH: &str = "/user/balance";

/// Lazily produced completion fragments. Ends after the `[DONE]` sentinel or
/// when the connection closes; a fresh request is needed to start over.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub api_key: String,
    /// Either an API base (`https://api.deepseek.com/v1`) or the full
    /// completions endpoint (`https://api.deepseek.com/v1/chat/completions`).
    pub api_base: String,
    pub model: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Longest silence tolerated between body reads; bounds a stalled stream.
    pub read_timeout: Duration,
}

impl LlmClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    completions_url: String,
    balance_url: String,
    model: String,
    request_timeout: Duration,
}

/// Completions and balance URLs for a configured `api_base`. Balance always
/// lives at the origin root.
fn endpoints(api_base: &str) -> Result<(String, String)> {
    let trimmed = api_base.trim().trim_end_matches('/');
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| LlmError::InvalidInput(format!("invalid api url {trimmed:?}: {e}")))?;
    let completions = if trimmed.ends_with(COMPLETIONS_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{COMPLETIONS_PATH}")
    };
    let balance = format!("{}{BALANCE_PATH}", url.origin().ascii_serialization());
    Ok((completions, balance))
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        let (completions_url, balance_url) = endpoints(&config.api_base)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Ok(Self {
            http,
            api_key: config.api_key,
            completions_url,
            balance_url,
            model: config.model,
            request_timeout: config.request_timeout,
        })
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, messages = messages.len()))]
    pub async fn complete(&self, messages: &[ChatMessage], temperature: f32) -> Result<String> {
        let req = CompletionRequest::new(&self.model, messages, temperature, false);
        tracing::debug!(url = %self.completions_url, "sending completion request");

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        tracing::info!(status = status.as_u16(), "completion response received");
        if status != reqwest::StatusCode::OK {
            let err = LlmError::from_status(status.as_u16(), &body);
            tracing::error!(error = %err, "completion request failed");
            return Err(err);
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)?;
        tracing::debug!(body = %body, "completion response body");
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| LlmError::ResponseFormat("response missing choices".to_string()))
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, messages = messages.len()))]
    pub async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<FragmentStream> {
        let req = CompletionRequest::new(&self.model, messages, temperature, true);

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        tracing::info!(status = status.as_u16(), "stream response received");
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let err = LlmError::from_status(status.as_u16(), &body);
            tracing::error!(error = %err, "stream request failed");
            return Err(err);
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold((sse, false), |(mut sse, done)| async move {
            if done {
                return None;
            }
            loop {
                match sse.as_mut().next().await? {
                    Ok(SseEvent::Data(data)) => match interpret_frame(&data) {
                        Ok(Frame::Fragment(text)) => return Some((Ok(text), (sse, false))),
                        Ok(Frame::Done) => return None,
                        Ok(Frame::Skip) => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "skipping malformed stream frame");
                            continue;
                        }
                    },
                    Ok(SseEvent::Other) => continue,
                    Err(e) => return Some((Err(e), (sse, true))),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn get_balance(&self) -> Result<Balance> {
        tracing::info!(url = %self.balance_url, "sending balance request");
        let response = self
            .http
            .get(&self.balance_url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        tracing::info!(status = status.as_u16(), "balance response received");
        if status != reqwest::StatusCode::OK {
            let err = LlmError::from_status(status.as_u16(), &body);
            tracing::error!(error = %err, "balance request failed");
            return Err(err);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

impl<'a> CompletionRequest<'a> {
    fn new(model: &'a str, messages: &'a [ChatMessage], temperature: f32, stream: bool) -> Self {
        Self {
            model,
            messages,
            temperature,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn client_for(server: &mockito::ServerGuard) -> LlmClient {
        let mut config = LlmClientConfig::new("test-key");
        config.api_base = server.url();
        LlmClient::new(config).expect("client")
    }

    /// Answers with SSE headers and one fragment, then goes silent.
    async fn stalling_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut request).await;
            let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n";
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{frame}\r\n",
                frame.len()
            );
            socket.write_all(head.as_bytes()).await.expect("write");
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn endpoints_accept_base_or_full_completions_url() {
        let (completions, balance) = endpoints("https://api.deepseek.com/").expect("base");
        assert_eq!(completions, "https://api.deepseek.com/chat/completions");
        assert_eq!(balance, "https://api.deepseek.com/user/balance");

        let (completions, balance) =
            endpoints("https://api.deepseek.com/v1/chat/completions").expect("full");
        assert_eq!(completions, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(balance, "https://api.deepseek.com/user/balance");

        assert!(endpoints("not a url").is_err());
    }

    #[tokio::test]
    async fn full_endpoint_url_is_used_verbatim() {
        let mut server = mockito::Server::new_async().await;
        let completions = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"ok"}}]}"#)
            .create_async()
            .await;
        let balance = server
            .mock("GET", "/user/balance")
            .with_status(200)
            .with_body(r#"{"is_available":true,"balance_infos":[]}"#)
            .create_async()
            .await;

        let mut config = LlmClientConfig::new("test-key");
        config.api_base = format!("{}/v1/chat/completions", server.url());
        let client = LlmClient::new(config).expect("client");

        let text = client
            .complete(&[ChatMessage::user("x")], 0.3)
            .await
            .expect("complete");
        assert_eq!(text, "ok");
        assert!(client.get_balance().await.expect("balance").is_available);
        completions.assert_async().await;
        balance.assert_async().await;
    }

    #[tokio::test]
    async fn stalled_stream_ends_with_an_error() {
        let mut config = LlmClientConfig::new("test-key");
        config.api_base = stalling_server().await;
        config.read_timeout = Duration::from_millis(200);
        let client = LlmClient::new(config).expect("client");

        let mut stream = client
            .complete_stream(&[ChatMessage::user("x")], 0.3)
            .await
            .expect("stream opens");
        let first = stream.next().await.expect("first item").expect("fragment");
        assert_eq!(first, "Hel");

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("read timeout must fire before the guard");
        assert!(matches!(next, Some(Err(LlmError::Http(_)))), "got {next:?}");
    }

    #[test]
    fn new_rejects_blank_api_key() {
        let err = LlmClient::new(LlmClientConfig::new("  ")).err().expect("must fail");
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn complete_posts_context_and_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(json!({
                "model": DEFAULT_MODEL,
                "stream": false,
                "messages": [
                    {"role": "user", "content": "earlier"},
                    {"role": "user", "content": "now"}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"answer"}}]}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let messages = crate::types::build_messages(&[ChatMessage::user("earlier")], "now");
        let text = client.complete(&messages, 0.3).await.expect("complete");
        assert_eq!(text, "answer");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn complete_maps_documented_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(402)
            .with_body("{}")
            .create_async()
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("x")], 0.3)
            .await
            .expect_err("402 must fail");
        assert_eq!(err.status(), Some(402));
        assert!(err.to_string().contains("余额不足"));
    }

    #[tokio::test]
    async fn complete_reports_missing_choices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .complete(&[ChatMessage::user("x")], 0.3)
            .await
            .expect_err("empty choices must fail");
        assert!(matches!(err, LlmError::ResponseFormat(_)));
    }

    #[tokio::test]
    async fn complete_stream_skips_malformed_frames_and_stops_at_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {broken\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let _mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({ "stream": true })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let stream = client_for(&server)
            .complete_stream(&[ChatMessage::user("x")], 0.3)
            .await
            .expect("stream opens");
        let fragments: Vec<String> = stream
            .map(|item| item.expect("fragment"))
            .collect()
            .await;
        assert_eq!(fragments, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn complete_stream_surfaces_status_errors_before_streaming() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .create_async()
            .await;

        let err = client_for(&server)
            .complete_stream(&[ChatMessage::user("x")], 0.3)
            .await
            .err()
            .expect("429 must fail");
        assert_eq!(err.status(), Some(429));
    }

    #[tokio::test]
    async fn get_balance_parses_balance_infos() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/user/balance")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                r#"{"is_available":true,"balance_infos":[{"currency":"CNY","total_balance":"10.00","granted_balance":"5.00","topped_up_balance":"5.00"}]}"#,
            )
            .create_async()
            .await;

        let balance = client_for(&server).get_balance().await.expect("balance");
        assert!(balance.is_available);
        assert_eq!(balance.balance_infos.len(), 1);
        assert_eq!(balance.balance_infos[0].currency, "CNY");
        assert_eq!(balance.balance_infos[0].granted_balance, "5.00");
    }

    #[tokio::test]
    async fn get_balance_maps_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/user/balance")
            .with_status(401)
            .create_async()
            .await;

        let err = client_for(&server).get_balance().await.expect_err("401");
        assert!(err.to_string().contains("认证失败"));
    }
}
