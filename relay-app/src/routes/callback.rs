use crate::server::{AppState, CallbackAuth};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use bytes::Bytes;
use relay_channels::{Callback, parse_callback, verify_signature, verify_token};
use std::sync::Arc;

const TIMESTAMP_HEADER: &str = "x-lark-request-timestamp";
const NONCE_HEADER: &str = "x-lark-request-nonce";
const SIGNATURE_HEADER: &str = "x-lark-signature";

pub fn router() -> axum::Router {
    axum::Router::new().route("/feishu/callback", post(handle_callback))
}

fn ok() -> Response {
    (StatusCode::OK, "OK").into_response()
}

fn server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Server Error").into_response()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// Checked only when all three signature headers are present.
fn signature_ok(auth: &CallbackAuth, headers: &HeaderMap, body: &[u8]) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match (
        header(TIMESTAMP_HEADER),
        header(NONCE_HEADER),
        header(SIGNATURE_HEADER),
    ) {
        (Some(timestamp), Some(nonce), Some(signature)) if !auth.encrypt_key.is_empty() => {
            verify_signature(timestamp, nonce, &auth.encrypt_key, body, signature)
        }
        _ => true,
    }
}

#[tracing::instrument(level = "info", skip_all, fields(body_len = body.len()))]
async fn handle_callback(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !signature_ok(&state.auth, &headers, &body) {
        tracing::warn!("callback signature mismatch");
        return unauthorized();
    }

    let parsed = match parse_callback(&body, &state.auth.encrypt_key) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to parse callback");
            return server_error();
        }
    };

    if !verify_token(&state.auth.verification_token, parsed.token.as_deref()) {
        tracing::warn!("callback verification token mismatch");
        return unauthorized();
    }

    match parsed.callback {
        Callback::UrlVerification { challenge } => {
            tracing::info!("answering url verification");
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        Callback::MessageReceived(event) => {
            let outcome = state.gateway.handle_event(event).await;
            tracing::info!(?outcome, "callback processed");
            ok()
        }
        Callback::Ignored { event_type } => {
            tracing::debug!(?event_type, "ignoring callback");
            ok()
        }
    }
}
