//! Relay configuration loader.
//!
//! Order: optional TOML file, then `.env`, then process environment, then
//! validation. Validation reports every missing key at once.

use crate::kv::RedisSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" => Some(Self::Production),
            "development" => Some(Self::Development),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub deepseek: DeepSeekConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Forward model output fragment by fragment instead of as one message.
    #[serde(default)]
    pub stream_replies: bool,
    /// Upper bound for handling one callback, including inference and delivery.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_callback_timeout_secs() -> u64 {
    180
}

fn default_max_in_flight() -> usize {
    64
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            host: default_host(),
            port: default_port(),
            stream_replies: false,
            callback_timeout_secs: default_callback_timeout_secs(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeepSeekConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_deepseek_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    relay_llm::DEFAULT_API_BASE.to_string()
}

fn default_model() -> String {
    relay_llm::DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    crate::dispatcher::DEFAULT_TEMPERATURE
}

fn default_deepseek_timeout_secs() -> u64 {
    120
}

impl Default for DeepSeekConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
            model: default_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_deepseek_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub encrypt_key: String,
    #[serde(default)]
    pub verification_token: String,
    #[serde(default = "default_feishu_base_url")]
    pub base_url: String,
}

fn default_feishu_base_url() -> String {
    relay_channels::DEFAULT_BASE_URL.to_string()
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            encrypt_key: String::new(),
            verification_token: String::new(),
            base_url: default_feishu_base_url(),
        }
    }
}

/// `host`/`port` stay optional so production can insist they were set.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_redis_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_redis_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_max_connections() -> usize {
    10
}

fn default_redis_timeout_secs() -> u64 {
    5
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            password: None,
            db: 0,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_redis_timeout_secs(),
            command_timeout_secs: default_redis_timeout_secs(),
        }
    }
}

impl RedisConfig {
    pub fn settings(&self) -> RedisSettings {
        RedisSettings {
            host: self
                .host
                .clone()
                .unwrap_or_else(|| "localhost".to_string()),
            port: self.port.unwrap_or(6379),
            password: self.password.clone().filter(|p| !p.is_empty()),
            db: self.db,
            max_connections: self.max_connections,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

impl RelayConfig {
    /// `path` wins over `RELAY_CONFIG`; without either, defaults plus
    /// environment are used.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });

        let mut cfg = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                Self::from_toml(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
            }
            None => Self::default(),
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(%e, "failed to load .env");
            }
        }

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Blank values are treated as unset.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ENVIRONMENT") {
            self.general.environment = Environment::parse(&v).ok_or_else(|| {
                anyhow::anyhow!("ENVIRONMENT={v:?}; expected production or development")
            })?;
        }
        if let Some(v) = var("HOST") {
            self.general.host = v;
        }
        if let Some(v) = var("PORT") {
            self.general.port = parse_var("PORT", &v)?;
        }
        if let Some(v) = var("STREAM_REPLIES") {
            self.general.stream_replies = parse_bool("STREAM_REPLIES", &v)?;
        }

        if let Some(v) = var("DEEPSEEK_API_KEY") {
            self.deepseek.api_key = v;
        }
        if let Some(v) = var("DEEPSEEK_API_URL") {
            self.deepseek.api_base = v;
        }
        if let Some(v) = var("DEEPSEEK_MODEL") {
            self.deepseek.model = v;
        }

        if let Some(v) = var("FEISHU_APP_ID") {
            self.feishu.app_id = v;
        }
        if let Some(v) = var("FEISHU_APP_SECRET") {
            self.feishu.app_secret = v;
        }
        if let Some(v) = var("FEISHU_ENCRYPT_KEY") {
            self.feishu.encrypt_key = v;
        }
        if let Some(v) = var("FEISHU_VERIFICATION_TOKEN") {
            self.feishu.verification_token = v;
        }
        if let Some(v) = var("FEISHU_BASE_URL") {
            self.feishu.base_url = v;
        }

        if let Some(v) = var("REDIS_HOST") {
            self.redis.host = Some(v);
        }
        if let Some(v) = var("REDIS_PORT") {
            self.redis.port = Some(parse_var("REDIS_PORT", &v)?);
        }
        if let Some(v) = var("REDIS_PASSWORD") {
            self.redis.password = Some(v);
        }
        if let Some(v) = var("REDIS_DB") {
            self.redis.db = parse_var("REDIS_DB", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let missing = self.missing_keys();
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "missing required configuration: {}",
                missing.join(", ")
            ));
        }
        if self.general.port == 0 {
            return Err(anyhow::anyhow!("general.port must be > 0"));
        }
        if self.deepseek.model.trim().is_empty() {
            return Err(anyhow::anyhow!("deepseek.model is required"));
        }
        if !(0.0..=2.0).contains(&self.deepseek.temperature) {
            return Err(anyhow::anyhow!("deepseek.temperature must be within 0.0..=2.0"));
        }
        if self.general.max_in_flight == 0 {
            return Err(anyhow::anyhow!("general.max_in_flight must be > 0"));
        }
        if self.redis.max_connections == 0 {
            return Err(anyhow::anyhow!("redis.max_connections must be > 0"));
        }
        Ok(())
    }

    /// Names use the environment-variable spelling.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let required = [
            ("DEEPSEEK_API_KEY", &self.deepseek.api_key),
            ("FEISHU_ENCRYPT_KEY", &self.feishu.encrypt_key),
            ("FEISHU_VERIFICATION_TOKEN", &self.feishu.verification_token),
            ("FEISHU_APP_ID", &self.feishu.app_id),
            ("FEISHU_APP_SECRET", &self.feishu.app_secret),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                missing.push(key);
            }
        }
        if self.general.environment.is_production() {
            if self.redis.host.as_deref().is_none_or(|h| h.trim().is_empty()) {
                missing.push("REDIS_HOST");
            }
            if self.redis.port.is_none() {
                missing.push("REDIS_PORT");
            }
        }
        missing
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.general.host, self.general.port)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.general.callback_timeout_secs.max(1))
    }
}

fn parse_var<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
}

fn parse_bool(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("invalid {key}={raw:?}; expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 5] = [
        ("DEEPSEEK_API_KEY", "sk-test"),
        ("FEISHU_ENCRYPT_KEY", "enc"),
        ("FEISHU_VERIFICATION_TOKEN", "tok"),
        ("FEISHU_APP_ID", "cli_1"),
        ("FEISHU_APP_SECRET", "secret"),
    ];

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.general.environment, Environment::Development);
        assert_eq!(cfg.general.port, 5000);
        assert_eq!(cfg.deepseek.model, "deepseek-reasoner");
        assert!((cfg.deepseek.temperature - 0.3).abs() < f32::EPSILON);
        let redis = cfg.redis.settings();
        assert_eq!((redis.host.as_str(), redis.port), ("localhost", 6379));
        assert_eq!(redis.max_connections, 10);
        assert_eq!(redis.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn validation_lists_every_missing_key() {
        let err = RelayConfig::default()
            .validate()
            .expect_err("empty config is invalid")
            .to_string();
        for (key, _) in REQUIRED {
            assert!(err.contains(key), "{err} should mention {key}");
        }
        assert!(!err.contains("REDIS_HOST"));
    }

    #[test]
    fn production_additionally_requires_redis_location() {
        let mut cfg = RelayConfig::default();
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("ENVIRONMENT", "Production"));
        cfg.apply_env_overrides(env(&pairs)).expect("overrides");
        assert_eq!(cfg.missing_keys(), vec!["REDIS_HOST", "REDIS_PORT"]);

        cfg.apply_env_overrides(env(&[("REDIS_HOST", "redis"), ("REDIS_PORT", "6380")]))
            .expect("overrides");
        cfg.validate().expect("valid production config");
        assert_eq!(cfg.redis.settings().port, 6380);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = RelayConfig::from_toml(
            r#"
            [general]
            port = 8080
            stream_replies = true

            [deepseek]
            api_key = "from-file"
            model = "deepseek-chat"

            [redis]
            db = 2
            max_connections = 4
            "#,
        )
        .expect("toml");
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "9000"));
        pairs.push(("STREAM_REPLIES", "false"));
        pairs.push(("DEEPSEEK_MODEL", " "));
        cfg.apply_env_overrides(env(&pairs)).expect("overrides");

        assert_eq!(cfg.general.port, 9000);
        assert!(!cfg.general.stream_replies);
        assert_eq!(cfg.deepseek.api_key, "sk-test");
        assert_eq!(cfg.deepseek.model, "deepseek-chat");
        assert_eq!(cfg.redis.db, 2);
        assert_eq!(cfg.redis.settings().max_connections, 4);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        cfg.validate().expect("valid");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = RelayConfig::default();
        assert!(cfg.apply_env_overrides(env(&[("PORT", "abc")])).is_err());
        assert!(cfg.apply_env_overrides(env(&[("ENVIRONMENT", "staging")])).is_err());
        assert!(cfg
            .apply_env_overrides(env(&[("STREAM_REPLIES", "maybe")]))
            .is_err());
    }
}
