//! REST surface status codes

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::*;
use tower::util::ServiceExt;
use warefleet::api::{ApiContext, RestApiServer};
use warefleet::testing::grid_map;

fn router(h: &Harness) -> axum::Router {
    let executor = Arc::new(warefleet::amr::AmrExecutor::new(
        Arc::clone(&h.map),
        &warefleet::config::AmrConfig::default(),
    ));
    RestApiServer::new(Arc::new(ApiContext {
        service_name: "warefleet-test".into(),
        map: Arc::clone(&h.map),
        amr_executor: executor,
        state: Arc::clone(&h.state),
        lifter: Arc::clone(&h.lifter),
        staging: Arc::clone(&h.staging),
        tasks: Arc::clone(&h.tasks),
    }))
    .router()
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let response = router(&h).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn amr_path_validates_inputs() {
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let app = router(&h);

    // Missing start/end/amr_id.
    let response = app
        .clone()
        .oneshot(post("/amr/path", serde_json::json!({"amr_id": "A1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Well-formed request is accepted.
    let response = app
        .clone()
        .oneshot(post(
            "/amr/path",
            serde_json::json!({"amr_id": "A1", "start": "n0-0", "end": "n2-2", "floor": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown endpoints are an internal pathfinding failure.
    let response = app
        .oneshot(post(
            "/amr/path",
            serde_json::json!({"amr_id": "A1", "start": "n0-0", "end": "missing", "floor": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn amr_data_is_404_until_the_pollers_report() {
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let app = router(&h);

    let response = app.clone().oneshot(get("/amr/data/A9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    h.state.set_amr_data("A9", "battery", serde_json::json!(88));
    let response = app.oneshot(get("/amr/data/A9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn lifter_routes_cover_validation_and_unknown_towers() {
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let app = router(&h);

    let response = app
        .clone()
        .oneshot(post("/lifter/request-task", serde_json::json!({"floor": 2})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post(
            "/lifter/request-task",
            serde_json::json!({"floor": 2, "vehicle": "S1", "lifter_id": "LIFTER_9"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(post(
            "/lifter/request-task",
            serde_json::json!({"floor": 2, "vehicle": "S1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.lifter.pending(), 1);

    let response = app
        .oneshot(post("/lifter/complete-task/any", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
