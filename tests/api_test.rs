// tests/api_test.rs — Integration test: trigger API behind the authorization gate

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use common::{experiment, Harness, Script};
use promptloop::api::{build_router, ApiState};
use promptloop::infra::config::{ApiConfig, ApiToken};

const OWNER: &str = "tok-owner";
const OUTSIDER: &str = "tok-outsider";

fn app(h: &Harness) -> Router {
    let config = ApiConfig {
        tokens: vec![
            ApiToken {
                token: OWNER.into(),
                principal: "alice".into(),
                projects: vec!["proj-1".into()],
            },
            ApiToken {
                token: OUTSIDER.into(),
                principal: "mallory".into(),
                projects: vec!["proj-2".into()],
            },
        ],
        ..ApiConfig::default()
    };
    build_router(ApiState::new(&h.pipeline, &config))
}

fn harness() -> Harness {
    let h = Harness::new(Script::default());
    let (exp, seed) = experiment("exp", &["writer-a", "writer-b"], 3, 1);
    h.register(&exp, &seed);
    h
}

fn request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if !body.is_empty() {
        builder = builder.header("content-type", "application/json");
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_missing_or_unknown_token_is_401() {
    let h = harness();
    let app = app(&h);
    let uri = "/api/v1/experiments/exp/iterations";

    let (status, body) = send(&app, request("POST", uri, None, "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "unauthorized");

    let (status, _) = send(&app, request("POST", uri, Some("tok-guess"), "")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.pipeline.queues.enqueued(promptloop::pipeline::queue::Stage::Execute), 0);
}

#[tokio::test]
async fn test_non_member_is_forbidden_before_dispatch() {
    let h = harness();
    let app = app(&h);
    let (status, body) = send(
        &app,
        request("POST", "/api/v1/experiments/exp/iterations", Some(OUTSIDER), ""),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");
    assert!(h.store().list_iterations("exp").unwrap().is_empty());
}

#[tokio::test]
async fn test_start_inspect_and_cancel() {
    let h = harness();
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/experiments/exp/iterations", Some(OWNER), ""),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["prompt_version_id"], "exp@v1");
    let it_id = body["iteration_id"].as_str().unwrap().to_string();

    // double dispatch
    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/experiments/exp/iterations",
            Some(OWNER),
            r#"{"prompt_version_id": "exp@v1"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let uri = format!("/api/v1/iterations/{it_id}");
    let (status, body) = send(&app, request("GET", &uri, Some(OWNER), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "executing");
    assert_eq!(body["counts"]["execute"]["expected"], 6);
    assert_eq!(body["counts"]["execute"]["completed"], 0);
    assert_eq!(body["decision"], Value::Null);

    let (status, _) = send(&app, request("GET", &uri, Some(OUTSIDER), "")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request("POST", &format!("{uri}/cancel"), Some(OWNER), ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");

    let (_, body) = send(&app, request("GET", &uri, Some(OWNER), "")).await;
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["reason"], "cancelled");
}

#[tokio::test]
async fn test_cancel_experiment_endpoint() {
    let h = harness();
    let app = app(&h);
    let it_id = h.start("exp", 1);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/experiments/exp/cancel", Some(OWNER), ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["iteration_id"], it_id.as_str());
    assert_eq!(body["state"], "stopped");

    let (_, body) = send(
        &app,
        request("POST", "/api/v1/experiments/exp/cancel", Some(OWNER), ""),
    )
    .await;
    assert_eq!(body["iteration_id"], Value::Null);
}

#[tokio::test]
async fn test_bad_requests() {
    let h = harness();
    let app = app(&h);

    let (status, body) = send(
        &app,
        request("POST", "/api/v1/experiments/exp/iterations", Some(OWNER), "{nope"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/v1/experiments/exp/iterations",
            Some(OWNER),
            r#"{"prompt_version_id": "exp@v9"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = send(
        &app,
        request("POST", "/api/v1/experiments/ghost/iterations", Some(OWNER), ""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cost_after_an_iteration() {
    let h = harness();
    let app = app(&h);
    h.start("exp", 1);
    h.drain().await;

    let (status, body) = send(&app, request("GET", "/api/v1/cost", Some(OWNER), "")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["total_usd"].as_f64().unwrap() > 0.0);
    assert!(body["calls"].as_u64().unwrap() >= 12);
    assert_eq!(body["cache"]["misses"].as_u64().unwrap() as usize, h.provider.calls());
}
