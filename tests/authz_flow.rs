mod helpers;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use serde_json::json;
use trackgate::authz::permissions::Permission;
use trackgate::authz::token::OffsetToken;
use trackgate::storage;
use trackgate::tracking::memory::MemoryStore;

use std::sync::Arc;

use helpers::{
    request, GatewayBuilder, UnavailableStore, CREATED_EXPERIMENT_ID, TAKEN_EXPERIMENT_NAME,
};

fn numbered_experiments(count: u32) -> MemoryStore {
    (1..=count).fold(MemoryStore::new(), |store, i| {
        store.with_experiment(&i.to_string(), &format!("exp-{i}"))
    })
}

fn experiment_ids(body: &serde_json::Value) -> Vec<String> {
    body["experiments"]
        .as_array()
        .expect("experiments array")
        .iter()
        .map(|e| e["experiment_id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_missing_or_wrong_credentials_get_challenge() {
    let gw = GatewayBuilder::new().build().await;

    let resp_status = gw
        .send(request(
            None,
            Method::GET,
            "/api/2.0/mlflow/experiments/get?experiment_id=1",
            None,
        ))
        .await
        .0;
    assert_eq!(resp_status, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/2.0/mlflow/experiments/get?experiment_id=1")
        .header(header::AUTHORIZATION, "Basic Ym9iOndyb25n")
        .body(Body::empty())
        .unwrap();
    let (status, _) = gw.send(wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_needs_no_credentials() {
    let gw = GatewayBuilder::new().build().await;
    let (status, body) = gw.send(request(None, Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_experiment_access_follows_grants() {
    let gw = GatewayBuilder::new()
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;
    let get_42 = "/api/2.0/mlflow/experiments/get?experiment_id=42";

    let (status, body) = gw.call_as("bob", Method::GET, get_42, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Permission denied");

    let (status, body) = gw
        .call_as(
            "admin",
            Method::POST,
            "/api/2.0/mlflow/experiments/permissions/create",
            Some(json!({"experiment_id": "42", "username": "bob", "permission": "READ"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["experiment_permission"]["permission"], "READ");
    assert_eq!(body["experiment_permission"]["experiment_id"], "42");

    let (status, body) = gw.call_as("bob", Method::GET, get_42, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["experiment"]["experiment_id"], "42");

    // Same rule under the ajax prefix
    let (status, _) = gw
        .call_as(
            "bob",
            Method::GET,
            "/ajax-api/2.0/mlflow/experiments/get?experiment_id=42",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // READ does not allow updates
    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/update",
            Some(json!({"experiment_id": "42", "new_name": "renamed"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_run_checks_use_the_parent_experiment() {
    let gw = GatewayBuilder::new()
        .with_store(
            MemoryStore::new()
                .with_experiment("42", "forecasting")
                .with_run("run-1", "42"),
        )
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;
    storage::create_experiment_permission(gw.db(), "42", "bob", "EDIT")
        .await
        .unwrap();

    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/runs/log-metric",
            Some(json!({"run_id": "run-1", "key": "loss", "value": 0.1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/runs/delete",
            Some(json!({"run_id": "run-1"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = gw
        .call_as("bob", Method::GET, "/api/2.0/mlflow/runs/get?run_id=ghost", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "RESOURCE_DOES_NOT_EXIST");
}

#[tokio::test]
async fn test_missing_parameter_is_a_bad_request() {
    let gw = GatewayBuilder::new().build().await;
    let (status, body) = gw
        .call_as("bob", Method::GET, "/api/2.0/mlflow/experiments/get", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_PARAMETER_VALUE");
    assert!(body["message"].as_str().unwrap().contains("experiment_id"));
}

#[tokio::test]
async fn test_artifact_proxy_checks_experiment_in_path() {
    let gw = GatewayBuilder::new().default_permission("READ").build().await;
    let file = "/api/2.0/mlflow-artifacts/artifacts/42/run-1/artifacts/model.pkl";

    let (status, _) = gw.call_as("bob", Method::GET, file, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = gw.call_as("bob", Method::PUT, file, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = gw.call_as("bob", Method::DELETE, file, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Listing the root has no experiment and falls back to the default
    let (status, _) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow-artifacts/artifacts",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    storage::create_experiment_permission(gw.db(), "42", "bob", "MANAGE")
        .await
        .unwrap();
    let (status, _) = gw.call_as("bob", Method::DELETE, file, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_percent_encoded_paths_are_classified_decoded() {
    let gw = GatewayBuilder::new()
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;

    for path in [
        "/api/2.0/mlflow/experiments/get?experiment_id=42",
        "/api/2.0/mlflow/experiments/%67et?experiment_id=42",
        "/api/2.0/mlflow/%65xperiments/get?experiment_id=42",
    ] {
        let (status, _) = gw.call_as("bob", Method::GET, path, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
    }
}

#[tokio::test]
async fn test_percent_encoded_artifact_experiment_is_checked() {
    let gw = GatewayBuilder::new().default_permission("READ").build().await;
    storage::create_experiment_permission(gw.db(), "123", "bob", "NO_PERMISSIONS")
        .await
        .unwrap();

    for path in [
        "/api/2.0/mlflow-artifacts/artifacts/123/w.pt",
        "/api/2.0/mlflow-artifacts/artifacts/%31%32%33/w.pt",
        "/api/2.0/mlflow-artifacts/%61rtifacts/123/w.pt",
    ] {
        let (status, _) = gw.call_as("bob", Method::GET, path, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
    }

    // Other experiments still get the default
    let (status, _) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow-artifacts/artifacts/%37/w.pt",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_encoded_slashes_and_dot_segments_are_rejected() {
    let gw = GatewayBuilder::new()
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;

    for path in [
        "/api/2.0/mlflow-artifacts/artifacts/7%2F..%2F123/w.pt",
        "/static/%2e%2e/api/2.0/mlflow/experiments/get?experiment_id=42",
        "/static/../api/2.0/mlflow/experiments/get?experiment_id=42",
        "/health/..%2Fapi/2.0/mlflow/experiments/get?experiment_id=42",
    ] {
        let (status, body) = gw.call_as("bob", Method::GET, path, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        assert_eq!(body["error_code"], "BAD_REQUEST");
    }
}

#[tokio::test]
async fn test_search_fails_when_backfill_lookup_fails() {
    let gw = GatewayBuilder::new()
        .with_store(numbered_experiments(6))
        .with_lookup_store(Arc::new(UnavailableStore))
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;
    storage::create_experiment_permission(gw.db(), "2", "bob", "READ")
        .await
        .unwrap();

    let (status, body) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow/experiments/search?max_results=2",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error_code"], "INTERNAL_ERROR");
    assert!(body.get("experiments").is_none());
}

#[tokio::test]
async fn test_oversized_request_body_is_refused() {
    let gw = GatewayBuilder::new().max_body_bytes(64).build().await;

    let payload = json!({ "name": "x".repeat(200) }).to_string();
    let oversized = Request::builder()
        .method(Method::POST)
        .uri("/api/2.0/mlflow/experiments/create")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))
        .unwrap();
    let (status, _) = gw.send(oversized).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, body) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/create",
            Some(json!({"name": "small"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["experiment_id"], CREATED_EXPERIMENT_ID);
}

#[tokio::test]
async fn test_search_experiments_backfills_and_replays() {
    let gw = GatewayBuilder::new()
        .with_store(numbered_experiments(6))
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;
    for id in ["2", "4", "5", "6"] {
        storage::create_experiment_permission(gw.db(), id, "bob", "READ")
            .await
            .unwrap();
    }

    let (status, body) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow/experiments/search?max_results=2",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(experiment_ids(&body), vec!["2", "4"]);
    let token = body["next_page_token"].as_str().unwrap().to_string();
    assert_eq!(OffsetToken::start_offset(Some(&token)).unwrap(), 4);

    let (status, body) = gw
        .call_as(
            "bob",
            Method::GET,
            &format!("/api/2.0/mlflow/experiments/search?max_results=2&page_token={token}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(experiment_ids(&body), vec!["5", "6"]);
    assert!(body.get("next_page_token").is_none());
}

#[tokio::test]
async fn test_admin_skips_checks_and_filtering() {
    let gw = GatewayBuilder::new()
        .with_store(numbered_experiments(4))
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;

    let (status, _) = gw
        .call_as(
            "admin",
            Method::GET,
            "/api/2.0/mlflow/experiments/get?experiment_id=3",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = gw
        .call_as(
            "admin",
            Method::POST,
            "/api/2.0/mlflow/experiments/search",
            Some(json!({"max_results": 2})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(experiment_ids(&body), vec!["1", "2"]);
    assert!(body["next_page_token"].is_string());
    // Only the tracking API itself searched
    assert_eq!(gw.store.search_calls(), 1);
}

#[tokio::test]
async fn test_creator_gets_manage_on_new_experiment() {
    let gw = GatewayBuilder::new()
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;

    let (status, body) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/create",
            Some(json!({"name": "churn"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["experiment_id"], CREATED_EXPERIMENT_ID);

    let grant = storage::get_experiment_permission(gw.db(), CREATED_EXPERIMENT_ID, "bob")
        .await
        .unwrap();
    assert_eq!(grant.permission, Permission::Manage);
}

#[tokio::test]
async fn test_failed_response_skips_after_hook() {
    let gw = GatewayBuilder::new().build().await;

    let (status, body) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/create",
            Some(json!({"name": TAKEN_EXPERIMENT_NAME})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "RESOURCE_ALREADY_EXISTS");

    let err = storage::get_experiment_permission(gw.db(), CREATED_EXPERIMENT_ID, "bob")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_registered_model_grants_follow_rename_and_delete() {
    let gw = GatewayBuilder::new()
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;

    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/registered-models/create",
            Some(json!({"name": "churn-model"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    storage::create_registered_model_permission(gw.db(), "churn-model", "alice", "READ")
        .await
        .unwrap();

    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/registered-models/rename",
            Some(json!({"name": "churn-model", "new_name": "churn-v2"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let bob = storage::get_registered_model_permission(gw.db(), "churn-v2", "bob")
        .await
        .unwrap();
    assert_eq!(bob.permission, Permission::Manage);
    let alice = storage::get_registered_model_permission(gw.db(), "churn-v2", "alice")
        .await
        .unwrap();
    assert_eq!(alice.permission, Permission::Read);
    assert!(
        storage::get_registered_model_permission(gw.db(), "churn-model", "bob")
            .await
            .unwrap_err()
            .is_not_found()
    );

    // alice can read but not delete
    let (status, _) = gw
        .call_as(
            "alice",
            Method::DELETE,
            "/api/2.0/mlflow/registered-models/delete",
            Some(json!({"name": "churn-v2"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = gw
        .call_as(
            "bob",
            Method::DELETE,
            "/api/2.0/mlflow/registered-models/delete",
            Some(json!({"name": "churn-v2"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    for user in ["bob", "alice"] {
        assert!(
            storage::get_registered_model_permission(gw.db(), "churn-v2", user)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}

#[tokio::test]
async fn test_logged_models_readable_through_experiment() {
    let gw = GatewayBuilder::new()
        .with_store(
            MemoryStore::new()
                .with_logged_model("m-1", "1")
                .with_logged_model("m-2", "2")
                .with_logged_model("m-3", "1"),
        )
        .default_permission("NO_PERMISSIONS")
        .build()
        .await;
    storage::create_experiment_permission(gw.db(), "1", "bob", "READ")
        .await
        .unwrap();

    let (status, _) = gw
        .call_as("bob", Method::GET, "/api/2.0/mlflow/logged-models/m-1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = gw
        .call_as("bob", Method::GET, "/api/2.0/mlflow/logged-models/m-2", None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/logged-models/search",
            Some(json!({"experiment_ids": ["1", "2"], "max_results": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["info"]["model_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["m-1", "m-3"]);
    assert!(body.get("next_page_token").is_none());
}

#[tokio::test]
async fn test_user_management_is_restricted() {
    let gw = GatewayBuilder::new().build().await;

    let (status, _) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow/users/get?username=alice",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = gw
        .call_as("bob", Method::GET, "/api/2.0/mlflow/users/get?username=bob", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "bob");
    assert_eq!(body["user"]["is_admin"], false);
    assert!(body["user"].get("password_hash").is_none());

    let new_user = json!({"username": "carol", "password": "s3cret"});
    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/users/create",
            Some(new_user.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = gw
        .call_as(
            "admin",
            Method::POST,
            "/api/2.0/mlflow/users/create",
            Some(new_user.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["username"], "carol");

    let (status, body) = gw
        .call_as(
            "admin",
            Method::POST,
            "/api/2.0/mlflow/users/create",
            Some(new_user),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "RESOURCE_ALREADY_EXISTS");

    let (status, _) = gw
        .call_as(
            "admin",
            Method::PATCH,
            "/api/2.0/mlflow/users/update-admin",
            Some(json!({"username": "bob", "is_admin": true})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    // Promotion takes effect on the next request
    let (status, _) = gw
        .call_as(
            "bob",
            Method::GET,
            "/api/2.0/mlflow/users/get?username=alice",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_create_user_requires_json() {
    let gw = GatewayBuilder::new().build().await;
    let mut req = request(
        Some("admin"),
        Method::POST,
        "/api/2.0/mlflow/users/create",
        None,
    );
    req.headers_mut().insert(
        header::CONTENT_TYPE,
        "application/x-www-form-urlencoded".parse().unwrap(),
    );
    let (status, body) = gw.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_permission_management_requires_manage() {
    let gw = GatewayBuilder::new().default_permission("EDIT").build().await;
    let grant = json!({"experiment_id": "7", "username": "alice", "permission": "READ"});

    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/permissions/create",
            Some(grant.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    storage::create_experiment_permission(gw.db(), "7", "bob", "MANAGE")
        .await
        .unwrap();
    let (status, _) = gw
        .call_as(
            "bob",
            Method::POST,
            "/api/2.0/mlflow/experiments/permissions/create",
            Some(grant),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = gw
        .call_as(
            "bob",
            Method::PATCH,
            "/api/2.0/mlflow/experiments/permissions/update",
            Some(json!({"experiment_id": "7", "username": "alice", "permission": "ROOT"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_PARAMETER_VALUE");
}

#[tokio::test]
async fn test_remote_user_header_authenticates() {
    let gw = GatewayBuilder::new()
        .authorization_function("remote-user")
        .build()
        .await;
    let uri = "/api/2.0/mlflow/experiments/get?experiment_id=1";

    let req = Request::builder()
        .uri(uri)
        .header("x-remote-user", "bob")
        .body(Body::empty())
        .unwrap();
    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .uri(uri)
        .header("x-remote-user", "mallory")
        .body(Body::empty())
        .unwrap();
    let (status, _) = gw.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
