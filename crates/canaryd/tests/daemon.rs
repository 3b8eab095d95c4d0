//! Daemon wiring tests.
//!
//! Builds the controller from a TOML config the way `canaryd serve` does,
//! probes real HTTP health endpoints, and drives it through the REST API.

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use tower::ServiceExt;

use canary_state::{ReleasePhase, RolloutOutcome, RolloutRequest};
use canaryd::CanaryConfig;

/// Serve `/health` returning 200 on an ephemeral port.
async fn health_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let app = axum::Router::new().route("/health", get(|| async { "ok" }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

fn config(data_dir: &Path, stable: &str, canary: &str) -> CanaryConfig {
    let toml = format!(
        r#"
[daemon]
listen = "127.0.0.1:0"
data_dir = '{data}'
default_stable_tag = "v1"

[evaluation]
interval = "100ms"
window = "300ms"
probe_timeout = "200ms"
max_duration = "5s"
failure_threshold = 2
operation_timeout = "5s"
retry_backoff = "10ms"

[evidence]
dir = '{evidence}'

[services.account]
replicas = 2
stable_address = "{stable}"
canary_address = "{canary}"
"#,
        data = data_dir.display(),
        evidence = data_dir.join("evidence").display(),
    );
    CanaryConfig::parse(&toml).unwrap()
}

async fn get_json(router: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn healthy_canary_is_promoted_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let addr = health_server().await;
    let config = config(dir.path(), &addr, &addr);

    let store = canaryd::open_store(&config).unwrap();
    let controller = canaryd::build_controller(&config, store).unwrap();
    assert_eq!(controller.release("account").unwrap().stable_tag, "v1");

    let record = controller
        .run(RolloutRequest::new("account", "v2", 20).with_promote(true))
        .await
        .unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    assert_eq!(record.from_tag, "v1");

    let router = canary_api::build_router(controller);
    let (status, body) = get_json(&router, "/api/v1/releases/account").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stable_tag"], "v2");
    assert_eq!(body["data"]["phase"], "idle");
    assert_eq!(body["data"]["traffic_split"], 0);

    let (_, routes) = get_json(&router, "/api/v1/routes").await;
    assert_eq!(routes["data"]["account"]["canary_weight"], 0);
}

#[tokio::test]
async fn unreachable_canary_rolls_back_and_writes_evidence() {
    let dir = tempfile::tempdir().unwrap();
    let stable = health_server().await;
    let canary = dead_address().await;
    let config = config(dir.path(), &stable, &canary);

    let store = canaryd::open_store(&config).unwrap();
    let controller = canaryd::build_controller(&config, store).unwrap();

    let record = controller
        .run(RolloutRequest::new("account", "v2", 20).with_promote(true))
        .await
        .unwrap();
    assert_eq!(record.outcome, Some(RolloutOutcome::RolledBack));
    assert!(record.reason.unwrap().contains("canary group failed 2 consecutive probes"));

    let release = controller.release("account").unwrap();
    assert_eq!(release.stable_tag, "v1");
    assert_eq!(release.phase, ReleasePhase::Idle);

    // The bundle is published in the background.
    let key = record.failure_evidence.unwrap().bundle_key;
    let mut written = false;
    for _ in 0..50 {
        if Path::new(&key).exists() {
            written = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(written, "evidence bundle {key} never appeared");
}

#[tokio::test]
async fn direct_release_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let addr = dead_address().await;
    let config = config(dir.path(), &addr, &addr);

    {
        let store = canaryd::open_store(&config).unwrap();
        let controller = canaryd::build_controller(&config, store).unwrap();
        let record = controller
            .run(RolloutRequest::new("account", "v3", 0).with_canary(false))
            .await
            .unwrap();
        assert_eq!(record.outcome, Some(RolloutOutcome::Promoted));
    }

    let store = canaryd::open_store(&config).unwrap();
    let controller = canaryd::build_controller(&config, store).unwrap();
    assert!(controller.recover().await.unwrap().is_empty());

    let router = canary_api::build_router(controller);
    let (status, body) = get_json(&router, "/api/v1/releases/account/history").await;
    assert_eq!(status, StatusCode::OK);
    let history = body["data"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["to_tag"], "v3");
    assert_eq!(history[0]["outcome"], "promoted");

    let (_, body) = get_json(&router, "/api/v1/releases/account").await;
    assert_eq!(body["data"]["stable_tag"], "v3");
}

#[tokio::test]
async fn unconfigured_service_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = dead_address().await;
    let config = config(dir.path(), &addr, &addr);
    let store = canaryd::open_store(&config).unwrap();
    let router = canary_api::build_router(canaryd::build_controller(&config, store).unwrap());

    let body = serde_json::to_vec(&RolloutRequest::new("ledger", "v2", 10)).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/rollouts")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
