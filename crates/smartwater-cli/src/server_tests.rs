use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::{to_bytes, Body};
use axum::extract::{Path, Query};
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use smartwater_core::{
    Credentials, Endpoints, Gateway, HttpTransport, OutcomeKind, ReadingsOutcome, StoreError,
    TransportError, UserStore,
};
use tokio::net::TcpListener;
use tower::ServiceExt;

use crate::server::{router, upstream_failure_status, ApiError, ApiState};

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("smartwater-server-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

fn state_with_upstream(dir: &PathBuf, thingspeak_url: String) -> ApiState {
    let upstream = HttpTransport::new(
        Endpoints {
            thingspeak_url,
            backend_url: closed_port_url(),
        },
        Duration::from_secs(2),
    )
    .expect("client");

    ApiState {
        users: Arc::new(UserStore::open(dir.join("users.json")).expect("users")),
        upstream: Arc::new(upstream),
        window_size: 50,
    }
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn fake_feed(
    Path(channel_id): Path<String>,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    if channel_id != "42" || params.get("api_key").map(String::as_str) != Some("RK") {
        return (StatusCode::BAD_REQUEST, Json(json!(-1)));
    }
    let body = json!({
        "channel": {"id": 42, "name": "tank"},
        "feeds": [
            {
                "created_at": "2025-03-01T10:00:00Z",
                "entry_id": 101,
                "field1": "12.5",
                "field2": "1"
            },
            {
                "created_at": "2025-03-01T10:00:15Z",
                "entry_id": 102,
                "field1": "13.0",
                "field8": "3.75"
            }
        ]
    });
    (StatusCode::OK, Json(body))
}

fn fake_thingspeak() -> Router {
    Router::new().route("/channels/{channel_id}/feeds.json", get(fake_feed))
}

#[tokio::test]
async fn healthz_is_public() {
    let dir = make_temp_dir("healthz");
    let app = router(state_with_upstream(&dir, closed_port_url()));

    let response = app.oneshot(get_request("/healthz", None)).await.expect("call");

    assert_eq!(response.status(), StatusCode::OK);
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn readings_require_a_valid_bearer_token() {
    let dir = make_temp_dir("auth");
    let app = router(state_with_upstream(&dir, closed_port_url()));

    let missing = app
        .clone()
        .oneshot(get_request("/api/data/readings", None))
        .await
        .expect("call");
    let bogus = app
        .oneshot(get_request("/api/data/readings", Some("bogus")))
        .await
        .expect("call");

    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(bogus.status(), StatusCode::UNAUTHORIZED);
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn readings_without_stored_settings_are_bad_request() {
    // Arrange
    let dir = make_temp_dir("unconfigured");
    let state = state_with_upstream(&dir, closed_port_url());
    let token = state.users.issue_token("alice").await.expect("token");
    let app = router(state);

    // Act
    let response = app
        .oneshot(get_request("/api/data/readings", Some(&token)))
        .await
        .expect("call");

    // Assert
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["message"], "ThingSpeak not configured");
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn put_config_merges_and_get_config_echoes() {
    // Arrange
    let dir = make_temp_dir("config");
    let state = state_with_upstream(&dir, closed_port_url());
    let token = state.users.issue_token("bob").await.expect("token");
    let app = router(state);
    let put = Request::builder()
        .method("PUT")
        .uri("/api/data/config")
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(r#"{"channelId":"42","readKey":"RK","wifiSSID":"barn"}"#))
        .expect("request");

    // Act
    let saved = app.clone().oneshot(put).await.expect("put");
    let fetched = app
        .oneshot(get_request("/api/data/config", Some(&token)))
        .await
        .expect("get");

    // Assert
    assert_eq!(saved.status(), StatusCode::OK);
    let saved = json_body(saved).await;
    assert_eq!(saved["channelId"], "42");
    assert_eq!(saved["wifiSSID"], "barn");
    assert_eq!(saved["writeKey"], "");
    assert_eq!(json_body(fetched).await, saved);
    let _ = fs::remove_dir_all(dir);
}

fn post_code(token: Option<&str>, body: &'static str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/data/code")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).expect("request")
}

#[tokio::test]
async fn saving_code_answers_created_and_keeps_the_snippet() {
    // Arrange
    let dir = make_temp_dir("save-code");
    let state = state_with_upstream(&dir, closed_port_url());
    let token = state.users.issue_token("erin").await.expect("token");
    let users = Arc::clone(&state.users);
    let app = router(state);

    // Act
    let response = app
        .oneshot(post_code(
            Some(&token),
            r#"{"name":"tank-a","code":"void setup() {}"}"#,
        ))
        .await
        .expect("call");

    // Assert
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["message"], "Code saved");
    let codes = users.saved_codes("erin").await.expect("codes");
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].name, "tank-a");
    assert_eq!(codes[0].code, "void setup() {}");
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn saving_code_requires_a_bearer_token() {
    let dir = make_temp_dir("save-code-auth");
    let app = router(state_with_upstream(&dir, closed_port_url()));

    let response = app
        .oneshot(post_code(None, r#"{"name":"x","code":"y"}"#))
        .await
        .expect("call");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_user_maps_to_not_found() {
    let err = ApiError::from(StoreError::UserNotFound("ghost".to_string()));

    assert_eq!(err.status, StatusCode::NOT_FOUND);
    assert_eq!(err.message, "User not found");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let dir = make_temp_dir("upstream-down");
    let state = state_with_upstream(&dir, closed_port_url());
    let token = state.users.issue_token("carol").await.expect("token");
    state
        .users
        .update_device_config(
            "carol",
            serde_json::from_value(json!({"channelId": "42", "readKey": "RK"})).expect("patch"),
        )
        .await
        .expect("settings");
    let app = router(state);

    let response = app
        .oneshot(get_request("/api/data/readings", Some(&token)))
        .await
        .expect("call");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        json_body(response).await["message"],
        "Error fetching data from ThingSpeak"
    );
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn only_server_errors_pass_through() {
    let status = |code: u16| TransportError::Status {
        status: code,
        message: String::new(),
    };

    assert_eq!(upstream_failure_status(&status(503)), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream_failure_status(&status(400)), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream_failure_status(&status(401)), StatusCode::BAD_GATEWAY);
    assert_eq!(
        upstream_failure_status(&TransportError::Unreachable("refused".to_string())),
        StatusCode::BAD_GATEWAY
    );
}

#[tokio::test]
async fn gateway_reads_through_the_proxy_end_to_end() {
    // Arrange
    let dir = make_temp_dir("end-to-end");
    let upstream_url = spawn(fake_thingspeak()).await;
    let state = state_with_upstream(&dir, upstream_url);
    let token = state.users.issue_token("dana").await.expect("token");
    let users = Arc::clone(&state.users);
    let proxy_url = spawn(router(state)).await;
    let client = HttpTransport::new(
        Endpoints {
            thingspeak_url: closed_port_url(),
            backend_url: format!("{proxy_url}/api"),
        },
        Duration::from_secs(5),
    )
    .expect("client");
    let gateway = Gateway::new(client, 50);
    let session = Credentials::Session {
        token: token.clone(),
    };

    // Act
    let before_settings = gateway.request_readings(&session).await;
    let bad_session = gateway
        .request_readings(&Credentials::Session {
            token: "stale-token".to_string(),
        })
        .await;
    users
        .update_device_config(
            "dana",
            serde_json::from_value(json!({"channelId": "42", "readKey": "WRONG"})).expect("patch"),
        )
        .await
        .expect("settings");
    let wrong_key = gateway.request_readings(&session).await;
    users
        .update_device_config(
            "dana",
            serde_json::from_value(json!({"readKey": "RK"})).expect("patch"),
        )
        .await
        .expect("settings");
    let configured = gateway.request_readings(&session).await;

    // Assert
    assert_eq!(before_settings, ReadingsOutcome::Unconfigured);
    assert_eq!(bad_session, ReadingsOutcome::Unauthorized);
    assert_eq!(wrong_key.kind(), OutcomeKind::Unknown);
    let ReadingsOutcome::Ok(series) = configured else {
        panic!("expected readings, got {configured:?}");
    };
    let ids: Vec<u64> = series.iter().map(|s| s.entry_id).collect();
    assert_eq!(ids, vec![101, 102]);
    assert_eq!(series[0].level_cm, 12.5);
    assert!(series[0].object_detected);
    assert_eq!(series[1].pump_runtime_hours, 3.75);
    let _ = fs::remove_dir_all(dir);
}
