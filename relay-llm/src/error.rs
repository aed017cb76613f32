use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    /// Non-200 answer from the inference backend. `message` is the
    /// user-facing description built by [`describe_status`].
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl LlmError {
    pub fn from_status(status: u16, body: &str) -> Self {
        Self::Api {
            status,
            message: describe_status(status, body),
        }
    }

    /// Stable short name, used when recording failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::Http(_) => "Http",
            Self::Api { .. } => "Api",
            Self::ResponseFormat(_) => "ResponseFormat",
            Self::StreamParse(_) => "StreamParse",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// (name, cause, remedy) for the status codes the backend documents.
fn known_status(status: u16) -> Option<(&'static str, &'static str, &'static str)> {
    let entry = match status {
        400 => ("格式错误", "请求体格式错误", "请根据错误信息提示修改请求体"),
        401 => (
            "认证失败",
            "API key 错误，认证失败",
            "请检查您的 API key 是否正确，如没有 API key，请先创建 API key",
        ),
        402 => ("余额不足", "账号余额不足", "请确认账户余额，并前往充值页面进行充值"),
        422 => ("参数错误", "请求体参数错误", "请根据错误信息提示修改相关参数"),
        429 => (
            "请求速率达到上限",
            "请求速率（TPM 或 RPM）达到上限",
            "请合理规划您的请求速率。",
        ),
        500 => (
            "服务器故障",
            "服务器内部故障",
            "请等待后重试。若问题一直存在，请联系我们解决",
        ),
        503 => ("服务器繁忙", "服务器负载过高", "请稍后重试您的请求"),
        _ => return None,
    };
    Some(entry)
}

pub fn describe_status(status: u16, body: &str) -> String {
    match known_status(status) {
        Some((name, cause, remedy)) => {
            format!("DeepSeek API {name} ({status}): {cause}。解决方法：{remedy}")
        }
        None => format!("DeepSeek API 请求失败，未知状态码: {status}，响应内容: {body}"),
    }
}
