//! HTTP surface tests against the in-memory application state.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use sf_core::TimingConfig;
use sf_server::{build_router, AppState, SharedState};
use sf_timingd::drain_partition;

fn make_state() -> SharedState {
    AppState::open_in_memory(TimingConfig::default()).unwrap()
}

async fn send_json(
    state: SharedState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let app = build_router(state);
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (status, body) = send_json(make_state(), "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["store_ok"].as_bool().unwrap());
    assert_eq!(body["ingest"]["events_processed"], 0);
}

#[tokio::test]
async fn test_timing_decision_for_fresh_user() {
    let state = make_state();
    let (status, body) = send_json(
        state.clone(),
        "POST",
        "/api/timing-decision",
        Some(serde_json::json!({"email": "alice@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["universal_id"].as_str().unwrap().starts_with("sf_"));
    assert_eq!(body["target_minute"], 0);
    assert_eq!(body["model_version"], "minute_level_click_based");
    assert_eq!(body["debug"]["suppressed"], false);
    assert!(body["explanation_ref"].as_str().unwrap().starts_with("explain:"));

    // The explanation is retrievable through its ref.
    let explanation_ref = body["explanation_ref"].as_str().unwrap().to_string();
    let (status, explanation) = send_json(
        state,
        "GET",
        &format!("/api/explanations/{}", explanation_ref),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(explanation["decision_id"], body["decision_id"]);
}

#[tokio::test]
async fn test_timing_decision_without_identifiers_is_bad_request() {
    let (status, body) = send_json(
        make_state(),
        "POST",
        "/api/timing-decision",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_expired_window_is_unprocessable() {
    let (status, body) = send_json(
        make_state(),
        "POST",
        "/api/timing-decision",
        Some(serde_json::json!({
            "email": "bob@example.com",
            "send_before": "2020-01-01T00:00:00Z",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "window_expired");
}

#[tokio::test]
async fn test_identity_resolve_then_link_then_traverse() {
    let state = make_state();

    let (status, first) = send_json(
        state.clone(),
        "POST",
        "/api/identity/resolve",
        Some(serde_json::json!({"email": "carol@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let original = first["universal_id"].as_str().unwrap().to_string();
    let email_hash = first["identifiers"]["email_hash"].as_str().unwrap().to_string();

    let (status, _) = send_json(
        state.clone(),
        "POST",
        "/api/identity/link",
        Some(serde_json::json!({
            "identifier_a": email_hash,
            "type_a": "email_hash",
            "identifier_b": "k_carol",
            "type_b": "klaviyo_id",
            "weight": 1.0,
            "source": "test",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, resolved) = send_json(
        state,
        "POST",
        "/api/identity/resolve",
        Some(serde_json::json!({"klaviyo_id": "k_carol"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["universal_id"], original);
    assert_eq!(resolved["confidence"], 1.0);
    let steps: Vec<String> = resolved["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect();
    assert!(steps.contains(&"graph_traversal:klaviyo_id->email_hash".to_string()));
}

#[tokio::test]
async fn test_ingest_publishes_then_pipeline_feeds_features() {
    let state = make_state();

    let click_ts = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    let (status, ack) = send_json(
        state.clone(),
        "POST",
        "/api/ingest",
        Some(serde_json::json!({
            "event_id": "api_ev_1",
            "event_type": "clicked",
            "timestamp": click_ts,
            "esp": "klaviyo",
            "recipient_email": "dora@example.com",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let partition = ack["partition"].as_u64().unwrap() as u32;

    // Drive the partition worker synchronously.
    let handled = drain_partition(&state.pipeline, state.event_log.as_ref(), partition).unwrap();
    assert_eq!(handled, 1);
    assert_eq!(state.event_log.committed(partition), Some(0));

    let (status, resolved) = send_json(
        state.clone(),
        "POST",
        "/api/identity/resolve",
        Some(serde_json::json!({"email": "dora@example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let uid = resolved["universal_id"].as_str().unwrap().to_string();

    let (status, features) =
        send_json(state, "GET", &format!("/api/features/{}", uid), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(features["counters"]["clicks_30d"], 1);
    assert!(features["curve_confidence"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_compute_features_endpoint() {
    let state = make_state();
    let (status, body) = send_json(
        state,
        "POST",
        "/api/compute-features",
        Some(serde_json::json!({"min_events": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["computed"], 0);
}

#[tokio::test]
async fn test_unknown_explanation_is_not_found() {
    let (status, body) = send_json(
        make_state(),
        "GET",
        "/api/explanations/explain:sf_nobody:missing",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
