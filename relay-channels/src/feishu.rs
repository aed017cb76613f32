use crate::traits::{MessageSender, SendReceipt};
use crate::types::{MessageId, OpenId};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn";

/// Refresh the tenant token this long before the platform expires it.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Codes the platform uses for an invalid or expired tenant token.
const TOKEN_INVALID_CODES: [i64; 3] = [99991661, 99991663, 99991668];

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct FeishuClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    base_url: String,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl FeishuClient {
    pub fn new(app_id: &str, app_secret: &str) -> Result<Self> {
        let app_id = app_id.trim();
        if app_id.is_empty() {
            return Err(anyhow!("feishu app id is required"));
        }
        let app_secret = app_secret.trim();
        if app_secret.is_empty() {
            return Err(anyhow!("feishu app secret is required"));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/open-apis/{path}", self.base_url)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn tenant_access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(self.api_url("auth/v3/tenant_access_token/internal"))
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .context("request tenant access token")?;
        let status = response.status();
        let body: TenantTokenResponse = response
            .json()
            .await
            .with_context(|| format!("decode tenant token response (status={status})"))?;
        if body.code != 0 {
            return Err(anyhow!(
                "tenant token request rejected: code={} msg={}",
                body.code,
                body.msg
            ));
        }
        let value = body
            .tenant_access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("tenant token response without token"))?;
        let lifetime = Duration::from_secs(body.expire.max(0) as u64)
            .saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        tracing::debug!(expires_in_secs = lifetime.as_secs(), "tenant access token refreshed");
        Ok(value)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }
}

#[async_trait::async_trait]
impl MessageSender for FeishuClient {
    #[tracing::instrument(level = "info", skip_all, fields(receive_id = %receive_id))]
    async fn send_text(&self, receive_id: &OpenId, text: &str) -> Result<SendReceipt> {
        if receive_id.trim().is_empty() {
            return Err(anyhow!("receive_id (open id) is required"));
        }
        let token = self.tenant_access_token().await?;
        let payload = serde_json::json!({
            "receive_id": receive_id.as_str(),
            "msg_type": "text",
            "content": serde_json::json!({ "text": text }).to_string(),
        });

        let response = self
            .http
            .post(self.api_url("im/v1/messages"))
            .query(&[("receive_id_type", "open_id")])
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .context("send message request")?;
        let status = response.status();
        let body: SendMessageResponse = response
            .json()
            .await
            .with_context(|| format!("decode send message response (status={status})"))?;

        if TOKEN_INVALID_CODES.contains(&body.code) {
            tracing::warn!(code = body.code, "tenant token rejected; dropping cached token");
            self.invalidate_token().await;
        }

        Ok(SendReceipt {
            code: body.code,
            msg: body.msg,
            message_id: body
                .data
                .and_then(|d| d.message_id)
                .map(MessageId::from),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: i64,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<SendMessageData>,
}

#[derive(Debug, Deserialize)]
struct SendMessageData {
    #[serde(default)]
    message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    async fn token_mock(server: &mut mockito::ServerGuard, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .match_body(Matcher::Json(json!({ "app_id": "app", "app_secret": "secret" })))
            .with_status(200)
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"t-1","expire":7200}"#)
            .expect(hits)
            .create_async()
            .await
    }

    fn client_for(server: &mockito::ServerGuard) -> FeishuClient {
        FeishuClient::new("app", "secret")
            .expect("client")
            .with_base_url(&server.url())
    }

    #[test]
    fn new_requires_credentials() {
        assert!(FeishuClient::new("", "secret").is_err());
        assert!(FeishuClient::new("app", " ").is_err());
    }

    #[tokio::test]
    async fn send_text_posts_open_id_message_and_caches_token() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, 1).await;
        let send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_query(Matcher::UrlEncoded(
                "receive_id_type".into(),
                "open_id".into(),
            ))
            .match_header("authorization", "Bearer t-1")
            .match_body(Matcher::Json(json!({
                "receive_id": "ou_1",
                "msg_type": "text",
                "content": "{\"text\":\"你好\"}"
            })))
            .with_status(200)
            .with_body(r#"{"code":0,"msg":"success","data":{"message_id":"om_9"}}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        let receipt = client
            .send_text(&OpenId::from("ou_1"), "你好")
            .await
            .expect("send");
        assert!(receipt.is_success());
        assert_eq!(receipt.message_id, Some(MessageId::from("om_9")));
        client
            .send_text(&OpenId::from("ou_1"), "你好")
            .await
            .expect("second send");

        token.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn send_text_returns_platform_rejection_as_receipt() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, 1).await;
        let _send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":230002,"msg":"bot not in chat"}"#)
            .create_async()
            .await;

        let receipt = client_for(&server)
            .send_text(&OpenId::from("ou_1"), "x")
            .await
            .expect("receipt");
        assert!(!receipt.is_success());
        assert_eq!(receipt.code, 230002);
        assert_eq!(receipt.message_id, None);
    }

    #[tokio::test]
    async fn invalid_token_code_forces_refresh() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, 2).await;
        let _send = server
            .mock("POST", "/open-apis/im/v1/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":99991663,"msg":"invalid access token"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = client_for(&server);
        for _ in 0..2 {
            let receipt = client
                .send_text(&OpenId::from("ou_1"), "x")
                .await
                .expect("receipt");
            assert!(!receipt.is_success());
        }
        token.assert_async().await;
    }

    #[tokio::test]
    async fn token_rejection_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_status(200)
            .with_body(r#"{"code":10003,"msg":"invalid app_secret"}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .send_text(&OpenId::from("ou_1"), "x")
            .await
            .expect_err("token failure");
        assert!(err.to_string().contains("10003"));
    }
}
