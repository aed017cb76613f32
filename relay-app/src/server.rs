//! Relay server and CLI entry points.
//!
//! Builds the process-wide [`AppState`] once and mounts the callback and
//! health routes on top of it.

use crate::config::{Environment, RelayConfig};
use crate::dedup::{DedupPolicy, Deduplicator};
use crate::delivery::{Deliverer, DeliveryPolicy};
use crate::dispatcher::{Dispatcher, format_balance};
use crate::gateway::Gateway;
use crate::kv::{KvStore, MemoryStore, RedisStore};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use relay_channels::{FeishuClient, OpenId};
use relay_llm::{LlmClient, LlmClientConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const STARTUP_PING_ATTEMPTS: u32 = 3;
const STARTUP_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Credentials the callback route checks requests against.
#[derive(Debug, Clone)]
pub struct CallbackAuth {
    pub verification_token: String,
    pub encrypt_key: String,
}

pub struct AppState {
    pub environment: Environment,
    pub kv_backend: &'static str,
    pub auth: CallbackAuth,
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(cfg: &RelayConfig, store: Arc<dyn KvStore>, gateway: Gateway) -> Self {
        Self {
            environment: cfg.general.environment,
            kv_backend: store.backend(),
            auth: CallbackAuth {
                verification_token: cfg.feishu.verification_token.clone(),
                encrypt_key: cfg.feishu.encrypt_key.clone(),
            },
            gateway,
        }
    }
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    tracing::info!(
        environment = cfg.general.environment.as_str(),
        bind_addr = %cfg.bind_addr(),
        model = %cfg.deepseek.model,
        api_base = %cfg.deepseek.api_base,
        stream_replies = cfg.general.stream_replies,
        "config ok"
    );

    let settings = cfg.redis.settings();
    let store = RedisStore::connect(&settings)
        .await
        .map_err(|e| anyhow::anyhow!("redis {}:{} unreachable: {e}", settings.host, settings.port))?;
    store
        .ping()
        .await
        .map_err(|e| anyhow::anyhow!("redis ping failed: {e}"))?;
    tracing::info!(host = %settings.host, port = settings.port, "redis ok");
    Ok(())
}

pub async fn balance(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let client = build_llm_client(&cfg)?;
    let balance = client.get_balance().await?;
    println!("{}", format_balance(&balance));
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let deliverer = Deliverer::new(Arc::new(build_feishu_client(&cfg)?), DeliveryPolicy::default());
    let recipient = OpenId::from(recipient.trim());
    if !deliverer.deliver(message, Some(&recipient)).await {
        return Err(anyhow::anyhow!("message to {recipient} was not delivered"));
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let addr: SocketAddr = cfg
        .bind_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {}: {e}", cfg.bind_addr()))?;
    tracing::info!(
        environment = cfg.general.environment.as_str(),
        bind_addr = %addr,
        model = %cfg.deepseek.model,
        api_base = %cfg.deepseek.api_base,
        feishu_base_url = %cfg.feishu.base_url,
        stream_replies = cfg.general.stream_replies,
        redis_max_connections = cfg.redis.max_connections,
        "relay starting"
    );

    let store = connect_store(&cfg).await?;
    let gateway = build_gateway(&cfg, store.clone())?;
    let state = Arc::new(AppState::new(&cfg, store, gateway));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;

    let app = build_app(state, cfg.callback_timeout(), cfg.general.max_in_flight);

    tracing::info!(%addr, "feishu relay serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

pub fn build_gateway(cfg: &RelayConfig, store: Arc<dyn KvStore>) -> Result<Gateway> {
    let backend = Arc::new(build_llm_client(cfg)?);
    let sender = Arc::new(build_feishu_client(cfg)?);
    Ok(Gateway::new(
        Deduplicator::new(store.clone(), DedupPolicy::default()),
        Dispatcher::new(backend, store)
            .with_temperature(cfg.deepseek.temperature)
            .with_stream_replies(cfg.general.stream_replies),
        Deliverer::new(sender, DeliveryPolicy::default()),
    ))
}

fn build_llm_client(cfg: &RelayConfig) -> Result<LlmClient> {
    let mut llm = LlmClientConfig::new(cfg.deepseek.api_key.clone());
    llm.api_base = cfg.deepseek.api_base.clone();
    llm.model = cfg.deepseek.model.clone();
    llm.request_timeout = Duration::from_secs(cfg.deepseek.request_timeout_secs);
    Ok(LlmClient::new(llm)?)
}

fn build_feishu_client(cfg: &RelayConfig) -> Result<FeishuClient> {
    Ok(FeishuClient::new(&cfg.feishu.app_id, &cfg.feishu.app_secret)?
        .with_base_url(&cfg.feishu.base_url))
}

/// Redis with a startup ping. Production refuses to start without it;
/// development continues on the in-memory store.
async fn connect_store(cfg: &RelayConfig) -> Result<Arc<dyn KvStore>> {
    let settings = cfg.redis.settings();
    let mut last_error = String::new();

    for attempt in 1..=STARTUP_PING_ATTEMPTS {
        let connected = match RedisStore::connect(&settings).await {
            Ok(store) => {
                let pinged = store.ping().await;
                pinged.map(|()| store)
            }
            Err(e) => Err(e),
        };
        match connected {
            Ok(store) => {
                tracing::info!(host = %settings.host, port = settings.port, attempt, "connected to redis");
                return Ok(Arc::new(store));
            }
            Err(e) => {
                tracing::warn!(
                    host = %settings.host,
                    port = settings.port,
                    attempt,
                    max_attempts = STARTUP_PING_ATTEMPTS,
                    error = %e,
                    "redis connection attempt failed"
                );
                last_error = e.to_string();
            }
        }
        if attempt < STARTUP_PING_ATTEMPTS {
            tokio::time::sleep(STARTUP_PING_INTERVAL).await;
        }
    }

    if cfg.general.environment.is_production() {
        return Err(anyhow::anyhow!(
            "cannot connect to redis at {}:{}: {last_error}",
            settings.host,
            settings.port
        ));
    }
    tracing::warn!(
        "redis unavailable in development; using in-memory store (dedup is process-local)"
    );
    Ok(Arc::new(MemoryStore::new()))
}

pub fn build_app(state: Arc<AppState>, request_timeout: Duration, max_in_flight: usize) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

/// Resolves on ctrl-c or SIGTERM. axum drains in-flight callbacks afterwards.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}
