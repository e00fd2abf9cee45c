use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use smartwater_core::{
    DeviceConfig, DeviceConfigPatch, HttpTransport, StoreError, TransportError, UserStore,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ApiState {
    pub users: Arc<UserStore>,
    pub upstream: Arc<HttpTransport>,
    pub window_size: u32,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound(_) => Self::new(StatusCode::NOT_FOUND, "User not found"),
            StoreError::Invalid(message) => Self::new(StatusCode::BAD_REQUEST, message),
            other => {
                error!(error = %other, "store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist settings")
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SaveCodeRequest {
    pub name: String,
    pub code: String,
}

/// The username behind a valid `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl FromRequestParts<ApiState> for AuthUser {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let users = Arc::clone(&state.users);
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        async move {
            let token = token.ok_or_else(|| ApiError::unauthorized("Missing or invalid token"))?;
            users
                .resolve(&token)
                .await
                .map(AuthUser)
                .ok_or_else(|| ApiError::unauthorized("Missing or invalid token"))
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/data/readings", get(readings_handler))
        .route(
            "/api/data/config",
            get(get_config_handler).put(put_config_handler),
        )
        .route("/api/data/code", post(save_code_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(bind: &str, state: ApiState) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, users_file = %state.users.path().display(), "proxy listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("received ctrl-c, shutting down proxy");
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readings_handler(
    State(state): State<ApiState>,
    AuthUser(username): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channel = state
        .users
        .device_config(&username)
        .await
        .unwrap_or_default()
        .channel();
    if channel.channel_id.is_empty() || channel.read_key.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "ThingSpeak not configured",
        ));
    }

    match state
        .upstream
        .fetch_raw_channel(&channel, state.window_size)
        .await
    {
        Ok(body) => Ok(Json(body)),
        Err(err) => {
            warn!(%username, error = %err, "upstream read failed");
            Err(ApiError::new(
                upstream_failure_status(&err),
                "Error fetching data from ThingSpeak",
            ))
        }
    }
}

async fn get_config_handler(
    State(state): State<ApiState>,
    AuthUser(username): AuthUser,
) -> Result<Json<DeviceConfig>, ApiError> {
    Ok(Json(state.users.device_config(&username).await?))
}

async fn put_config_handler(
    State(state): State<ApiState>,
    AuthUser(username): AuthUser,
    Json(patch): Json<DeviceConfigPatch>,
) -> Result<Json<DeviceConfig>, ApiError> {
    let saved = state.users.update_device_config(&username, patch).await?;
    info!(%username, channel_id = %saved.channel_id, "device settings saved");
    Ok(Json(saved))
}

async fn save_code_handler(
    State(state): State<ApiState>,
    AuthUser(username): AuthUser,
    Json(request): Json<SaveCodeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state
        .users
        .save_code(&username, &request.name, &request.code)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "message": "Code saved" }))))
}

/// Upstream 5xx codes pass through; anything else becomes 502 so clients never read an
/// upstream 400/401 as this proxy's own "not configured" or "bad session".
pub(crate) fn upstream_failure_status(err: &TransportError) -> StatusCode {
    match err {
        TransportError::Status { status, .. } if (500..600).contains(status) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::BAD_GATEWAY,
    }
}
