//! End-to-end dispatch tests against an in-process control service.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use maika_core::{Config, ControlClient, ControlError, Dispatch, Login, ReconnectPolicy};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// What the fake service saw, per route.
#[derive(Clone, Default)]
struct Recorded {
    /// (authorization header, body) per control POST.
    control: Arc<Mutex<Vec<(String, Value)>>>,
    /// (route label, body) per auth POST.
    logins: Arc<Mutex<Vec<(&'static str, Value)>>>,
}

async fn record_login(
    State(recorded): State<Recorded>,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorded.logins.lock().await.push(("login", body));
    Json(json!({"data": {"access_token": "T1", "id": "U1"}}))
}

async fn record_otp_login(
    State(recorded): State<Recorded>,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorded.logins.lock().await.push(("otp", body));
    Json(json!({"data": {"access_token": "T2", "id": 7}}))
}

async fn record_control(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    recorded.control.lock().await.push((authorization, body));
    Json(json!({"message": "ok"}))
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Serves the recording routes on an ephemeral port; returns the base URL.
async fn spawn_service(recorded: Recorded) -> String {
    init_logging();
    let app = Router::new()
        .route("/v1/auth/login", post(record_login))
        .route("/v1/auth/otp/login", post(record_otp_login))
        .route("/v1/user-device/control", post(record_control))
        .with_state(recorded);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client_for(base_url: &str) -> ControlClient {
    let mut config = Config::for_base_url(base_url).unwrap();
    config.reconnect = ReconnectPolicy::Never;
    ControlClient::new(&config).unwrap()
}

/// Lets the shared dispatch window lapse between genuine calls.
async fn let_window_pass() {
    sleep(Duration::from_millis(1100)).await;
}

#[tokio::test]
async fn email_identity_targets_the_password_login_endpoint() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    let outcome = client.authenticate("a@b.com", "x").await.unwrap();
    assert_eq!(
        outcome,
        Login::Authenticated {
            account_id: "U1".to_string()
        }
    );

    let logins = recorded.logins.lock().await;
    assert_eq!(logins.len(), 1);
    let (route, body) = &logins[0];
    assert_eq!(*route, "login");
    assert_eq!(*body, json!({"email": "a@b.com", "password": "x"}));
}

#[tokio::test]
async fn phone_identity_targets_the_otp_login_endpoint() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    let outcome = client.authenticate("+84901234567", "x").await.unwrap();
    assert_eq!(
        outcome,
        Login::Authenticated {
            account_id: "7".to_string()
        }
    );

    let logins = recorded.logins.lock().await;
    assert_eq!(logins.len(), 1);
    let (route, body) = &logins[0];
    assert_eq!(*route, "otp");
    assert_eq!(
        *body,
        json!({"phone_number": "+84901234567", "password": "x"})
    );
}

#[tokio::test]
async fn dispatch_before_login_carries_an_empty_bearer() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    let outcome = client.send_utterance("Maika", "mở nhạc").await.unwrap();
    assert_eq!(outcome, Dispatch::Sent { message: Some("ok".to_string()) });

    let control = recorded.control.lock().await;
    assert_eq!(control.len(), 1);
    assert_eq!(control[0].0, "Bearer ");
}

#[tokio::test]
async fn speak_after_login_uses_the_stored_token_and_template() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    client.authenticate("a@b.com", "x").await.unwrap();
    assert!(client.is_authenticated().await);
    let_window_pass().await;

    let outcome = client.speak("Maika", "hi").await.unwrap();
    assert_eq!(outcome, Dispatch::Sent { message: Some("ok".to_string()) });

    let control = recorded.control.lock().await;
    assert_eq!(control.len(), 1);
    let (authorization, body) = &control[0];
    assert_eq!(authorization, "Bearer T1");
    assert_eq!(
        *body,
        json!({"calling_name": "Maika", "utterance": "repeat after me hi"})
    );
}

#[tokio::test]
async fn echo_toggles_send_the_fixed_sentinels() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    client.enable_echo_mode("Maika").await.unwrap();
    let_window_pass().await;
    client.disable_echo_mode("Maika").await.unwrap();

    let control = recorded.control.lock().await;
    assert_eq!(control.len(), 2);
    assert_eq!(control[0].1["utterance"], "turn on echo mode");
    assert_eq!(control[1].1["utterance"], "stop");
}

#[tokio::test]
async fn second_dispatch_within_the_window_is_suppressed() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    let first = client.send_utterance("Maika", "mở nhạc").await.unwrap();
    assert!(matches!(first, Dispatch::Sent { .. }));

    sleep(Duration::from_millis(200)).await;
    let second = client.send_utterance("Maika", "dừng").await.unwrap();
    assert_eq!(second, Dispatch::Throttled);

    // Exactly one POST, carrying the first utterance.
    let control = recorded.control.lock().await;
    assert_eq!(control.len(), 1);
    assert_eq!(
        control[0].1,
        json!({"calling_name": "Maika", "utterance": "mở nhạc"})
    );
}

#[tokio::test]
async fn dispatches_a_window_apart_both_reach_the_service() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    client.send_utterance("Maika", "mở nhạc").await.unwrap();
    let_window_pass().await;
    client.send_utterance("Maika", "dừng").await.unwrap();

    let control = recorded.control.lock().await;
    assert_eq!(control.len(), 2);
    assert_eq!(control[1].1["utterance"], "dừng");
}

#[tokio::test]
async fn suppression_extends_across_repeated_attempts() {
    let recorded = Recorded::default();
    let client = client_for(&spawn_service(recorded.clone()).await);

    client.send_utterance("Maika", "mở nhạc").await.unwrap();
    // 600 ms spacing would clear a fixed window, but every suppressed attempt
    // refreshes it, so nothing else ever goes out.
    for _ in 0..3 {
        sleep(Duration::from_millis(600)).await;
        let outcome = client.send_utterance("Maika", "dừng").await.unwrap();
        assert_eq!(outcome, Dispatch::Throttled);
    }

    assert_eq!(recorded.control.lock().await.len(), 1);
}

#[tokio::test]
async fn rejected_login_leaves_the_session_unauthenticated() {
    async fn reject() -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
    let app = Router::new().route("/v1/auth/login", post(reject));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = client_for(&format!("http://{}", addr));
    let err = client.authenticate("a@b.com", "wrong").await.unwrap_err();
    match err {
        ControlError::Status(status) => assert_eq!(status, StatusCode::UNAUTHORIZED),
        other => panic!("Expected a status error, got {:?}", other),
    }
    assert!(!client.is_authenticated().await);
}

#[tokio::test]
async fn malformed_login_body_is_distinguished_and_ignored() {
    async fn garbled() -> &'static str {
        "not json"
    }
    let app = Router::new().route("/v1/auth/login", post(garbled));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = client_for(&format!("http://{}", addr));
    let err = client.authenticate("a@b.com", "x").await.unwrap_err();
    assert!(matches!(err, ControlError::Malformed(_)));
    assert!(!client.is_authenticated().await);
}

#[tokio::test]
async fn unreachable_service_is_a_transport_failure() {
    // Nothing listens on this port.
    let client = client_for("http://127.0.0.1:9");
    let err = client.send_utterance("Maika", "mở nhạc").await.unwrap_err();
    assert!(matches!(err, ControlError::Transport(_)));
}
