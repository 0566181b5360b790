//! Integration tests: audited CRUD, record history, activity-log filters, import, error codes.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use tracker_api::server::{self, AppState};
use tracker_store::{InMemoryTrackerStore, SqliteTrackerStore, TrackerStore};
use tracker_types::{AuditListResponse, ImportResponse, Operation};

fn app_over(store: Arc<dyn TrackerStore>) -> axum::Router {
    server::router(Arc::new(AppState { store }))
}

fn test_app() -> axum::Router {
    app_over(Arc::new(InMemoryTrackerStore::new()))
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let j: Value = serde_json::from_slice(&body).unwrap();
    (status, j)
}

async fn post(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-actor", "admin")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, req).await
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

#[tokio::test]
async fn health_is_ok() {
    let app = test_app();
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn tables_lists_catalog() {
    let app = test_app();
    let (status, j) = get(&app, "/tables").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = j["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"user_pii"));
    assert!(names.contains(&"weekly_challenge"));
    assert_eq!(names.len(), 8);
}

#[tokio::test]
async fn insert_user_profile_records_create() {
    let app = test_app();
    let (status, j) = post(&app, "/entities/user_pii", json!({"email": "a@x.com", "name": "A"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(j["code"], 200);
    assert_eq!(j["data"]["operation"], "CREATE");
    assert_eq!(j["data"]["record_identifier"], "a@x.com");
    assert_eq!(j["data"]["changed_by"], "admin");
    assert!(j["data"]["metadata"]["request_id"].is_string());
    assert!(j["data"].get("old_data").map_or(true, Value::is_null));

    let (_, j) = get(&app, "/audit/logs/user_pii/a@x.com").await;
    let history = j["data"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["new_data"]["name"], "A");
}

#[tokio::test]
async fn update_then_history_shows_both_states() {
    let app = test_app();
    post(
        &app,
        "/entities/project_submission",
        json!({"workshop_name": "W1", "email": "a@x.com", "valid": false}),
    )
    .await;
    let (status, j) = post(
        &app,
        "/entities/project_submission/update",
        json!({"key": {"workshop_name": "W1", "email": "a@x.com"}, "changes": {"valid": true}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(j["data"]["record_identifier"], "W1|a@x.com");
    assert_eq!(j["data"]["old_data"]["valid"], false);
    assert_eq!(j["data"]["new_data"]["valid"], true);

    let (_, j) = get(&app, "/audit/logs/project_submission/W1%7Ca@x.com").await;
    let resp: AuditListResponse = serde_json::from_value(j).unwrap();
    let ops: Vec<Operation> = resp.data.unwrap().iter().map(|r| r.operation).collect();
    assert_eq!(ops, vec![Operation::Update, Operation::Create]);
}

#[tokio::test]
async fn delete_weekly_challenge_keeps_prior_state() {
    let app = test_app();
    post(
        &app,
        "/entities/weekly_challenge",
        json!({"week_number": 3, "email": "b@x.com", "score": 7}),
    )
    .await;
    let (status, j) = post(
        &app,
        "/entities/weekly_challenge/delete",
        json!({"key": {"week_number": 3, "email": "b@x.com"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(j["data"]["operation"], "DELETE");
    assert_eq!(j["data"]["record_identifier"], "3|b@x.com");
    assert_eq!(j["data"]["old_data"]["score"], 7);
    assert!(j["data"].get("new_data").map_or(true, Value::is_null));

    let (status, j) = post(
        &app,
        "/entities/weekly_challenge/get",
        json!({"key": {"week_number": 3, "email": "b@x.com"}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(j["code"], 404);
}

#[tokio::test]
async fn error_codes_follow_store_errors() {
    let app = test_app();
    let row = json!({"form_name": "F1", "email": "a@x.com"});
    post(&app, "/entities/form_response", row.clone()).await;

    let (status, j) = post(&app, "/entities/form_response", row).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(j["code"], 409);

    let (status, _) = post(&app, "/entities/form_response", json!({"email": "a@x.com"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, j) = post(&app, "/entities/form_response", json!([1, 2])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(j["message"].as_str().unwrap().contains("malformed snapshot"));

    let (status, _) = post(&app, "/entities/badges", json!({"email": "a@x.com"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post(
        &app,
        "/entities/form_response/update",
        json!({"key": {"form_name": "F9", "email": "a@x.com"}, "changes": {"answer": "x"}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Only the first insert reached the log.
    let (_, j) = get(&app, "/audit/logs").await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_audit_write_leaves_row_unchanged() {
    let store = Arc::new(InMemoryTrackerStore::new());
    let app = app_over(store.clone());
    post(&app, "/entities/user_pii", json!({"email": "a@x.com", "name": "A"})).await;

    store.fail_next_audit_append();
    let (status, j) = post(
        &app,
        "/entities/user_pii/update",
        json!({"key": {"email": "a@x.com"}, "changes": {"name": "B"}}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(j["code"], 500);

    let (_, j) = post(&app, "/entities/user_pii/get", json!({"key": {"email": "a@x.com"}})).await;
    assert_eq!(j["data"]["name"], "A");
    let (_, j) = get(&app, "/audit/logs?entity_type=user_pii").await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn audit_log_filters_and_limits() {
    let app = test_app();
    for i in 0..3 {
        post(&app, "/entities/user_pii", json!({"email": format!("u{}@x.com", i)})).await;
    }
    post(&app, "/entities/lab_completion", json!({"lab_name": "L1", "email": "u0@x.com"})).await;
    post(
        &app,
        "/entities/user_pii/update",
        json!({"key": {"email": "u1@x.com"}, "changes": {"name": "U1"}}),
    )
    .await;

    let (_, j) = get(&app, "/audit/logs?entity_type=user_pii&operation=INSERT").await;
    let ids: Vec<i64> = j["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![3, 2, 1]);

    let (_, j) = get(&app, "/audit/logs?operation=update").await;
    assert_eq!(j["data"][0]["record_identifier"], "u1@x.com");

    let (_, j) = get(&app, "/audit/logs?limit=2&offset=1").await;
    let ids: Vec<i64> = j["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![4, 3]);

    let (_, j) = get(&app, "/audit/logs?record_identifier=L1%7Cu0@x.com&order=timestamp_desc").await;
    assert_eq!(j["data"].as_array().unwrap().len(), 1);

    let (_, j) = get(&app, "/audit/logs?since=2100-01-01T00:00:00Z").await;
    assert!(j["data"].as_array().unwrap().is_empty());

    let (status, _) = get(&app, "/audit/logs?operation=UPSERT").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&app, "/audit/logs?since=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&app, "/audit/logs?order=oldest").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn import_counts_rows_and_audits_each_write() {
    let app = test_app();
    post(
        &app,
        "/entities/aws_team_building",
        json!({"workshop_name": "W1", "email": "a@x.com", "team": 1}),
    )
    .await;

    let (status, j) = post(
        &app,
        "/entities/aws_team_building/import",
        json!({
            "rows": [
                {"workshop_name": "W1", "email": "a@x.com", "team": 2},
                {"workshop_name": "W1", "email": "b@x.com", "team": 3},
                {"team": 4}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let resp: ImportResponse = serde_json::from_value(j).unwrap();
    let summary = resp.data.unwrap();
    assert_eq!((summary.inserted, summary.updated, summary.skipped), (1, 1, 1));

    let (_, j) = get(&app, "/audit/logs?entity_type=aws_team_building").await;
    assert_eq!(j["data"].as_array().unwrap().len(), 3);

    let (status, _) = post(
        &app,
        "/entities/aws_team_building/import",
        json!({"rows": [{"workshop_name": "W2", "email": "c@x.com"}, "not a row"]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn import_update_mode_with_match_fields() {
    let app = test_app();
    post(&app, "/entities/user_pii", json!({"email": "a@x.com", "name": "A"})).await;
    let (_, j) = post(
        &app,
        "/entities/user_pii/import",
        json!({
            "mode": "update",
            "match_fields": ["email"],
            "rows": [{"email": "a@x.com", "name": "A2"}, {"email": "z@x.com", "name": "Z"}]
        }),
    )
    .await;
    assert_eq!(j["data"], json!({"inserted": 0, "updated": 1, "skipped": 1}));

    let (_, j) = get(&app, "/entities/user_pii").await;
    let rows = j["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "A2");
}

#[tokio::test]
async fn sqlite_backend_serves_the_same_routes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteTrackerStore::new(dir.path().join("tracker.db")).unwrap();
    let app = app_over(Arc::new(store));

    post(&app, "/entities/verification", json!({"workshop_name": "W1", "email": "a@x.com"})).await;
    let (status, j) = post(
        &app,
        "/entities/verification/update",
        json!({"key": {"workshop_name": "W1", "email": "a@x.com"}, "changes": {"blog_valid": true}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(j["data"]["id"], 2);

    let (_, j) = get(&app, "/audit/logs/verification/W1%7Ca@x.com").await;
    let history = j["data"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["operation"], "UPDATE");
    assert_eq!(history[1]["changed_by"], "admin");
}
