use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64ct::{Base64, Encoding};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use tower::ServiceExt;
use trackgate::authz::params::RequestParams;
use trackgate::errors::GateError;
use trackgate::settings::Settings;
use trackgate::tracking::memory::MemoryStore;
use trackgate::tracking::{
    ExperimentSearch, LoggedModelSearch, Page, RegisteredModelSearch, ResourceStore,
};
use trackgate::web::{self, AppContext};

use super::db::{seed_user, TestDb, TEST_PASSWORD};

/// Experiment id the fake API assigns on create
pub const CREATED_EXPERIMENT_ID: &str = "100";
/// Experiment name the fake API reports as already taken
pub const TAKEN_EXPERIMENT_NAME: &str = "taken";

/// A gateway in front of an in-process tracking API.
///
/// Seeded users: `admin` (admin), `bob` and `alice`, all with [`TEST_PASSWORD`].
pub struct Gateway {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    db: TestDb,
}

impl Gateway {
    pub fn db(&self) -> &DatabaseConnection {
        self.db.connection()
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self
            .router
            .clone()
            .oneshot(req)
            .await
            .expect("router is infallible");
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    /// Send as `user` with Basic credentials.
    pub async fn call_as(
        &self,
        user: &str,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.send(request(Some(user), method, uri, body)).await
    }
}

/// Build a request, authenticated with Basic credentials when `user` is set.
/// A JSON body sets the JSON content type.
pub fn request(user: Option<&str>, method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        let encoded = Base64::encode_string(format!("{user}:{TEST_PASSWORD}").as_bytes());
        builder = builder.header(header::AUTHORIZATION, format!("Basic {encoded}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("Failed to build request")
}

/// Builder for a test gateway
pub struct GatewayBuilder {
    store: MemoryStore,
    lookup_store: Option<Arc<dyn ResourceStore>>,
    default_permission: String,
    authorization_function: String,
    max_body_bytes: Option<usize>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            lookup_store: None,
            default_permission: "READ".to_string(),
            authorization_function: "basic".to_string(),
            max_body_bytes: None,
        }
    }

    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    /// Store the gateway itself queries for lookups and backfill. The fake
    /// API keeps answering from the main store.
    pub fn with_lookup_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.lookup_store = Some(store);
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    pub fn default_permission(mut self, permission: &str) -> Self {
        self.default_permission = permission.to_string();
        self
    }

    pub fn authorization_function(mut self, name: &str) -> Self {
        self.authorization_function = name.to_string();
        self
    }

    pub async fn build(self) -> Gateway {
        let db = TestDb::new().await;
        seed_user(db.connection(), "admin", true).await;
        seed_user(db.connection(), "bob", false).await;
        seed_user(db.connection(), "alice", false).await;

        let mut settings = Settings::default();
        settings.auth.default_permission = self.default_permission;
        settings.auth.authorization_function = self.authorization_function;
        if let Some(limit) = self.max_body_bytes {
            settings.server.max_body_bytes = limit;
        }

        let store = Arc::new(self.store);
        let lookup_store = self
            .lookup_store
            .unwrap_or_else(|| store.clone() as Arc<dyn ResourceStore>);
        let ctx = AppContext::new(settings, db.connection().clone(), lookup_store)
            .expect("Failed to build app context");
        let router = web::app(ctx, fake_api(store.clone()));

        Gateway { router, store, db }
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resource store whose searches always fail, as if the tracking server went
/// away between two calls.
pub struct UnavailableStore;

#[async_trait]
impl ResourceStore for UnavailableStore {
    async fn run_experiment_id(&self, run_id: &str) -> Result<String, GateError> {
        Err(GateError::ResourceNotFound(format!("Run with id={run_id} not found")))
    }

    async fn logged_model_experiment_id(&self, model_id: &str) -> Result<String, GateError> {
        Err(GateError::ResourceNotFound(format!(
            "Logged model with id={model_id} not found"
        )))
    }

    async fn experiment_id_by_name(&self, _name: &str) -> Result<Option<String>, GateError> {
        Ok(None)
    }

    async fn search_experiments(
        &self,
        _query: &ExperimentSearch,
        _page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        Err(GateError::Internal("tracking server unavailable".to_string()))
    }

    async fn search_registered_models(
        &self,
        _query: &RegisteredModelSearch,
        _page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        Err(GateError::Internal("tracking server unavailable".to_string()))
    }

    async fn search_logged_models(
        &self,
        _query: &LoggedModelSearch,
        _page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        Err(GateError::Internal("tracking server unavailable".to_string()))
    }
}

/// Tracking API stand-in. Searches are answered from `store`; everything it
/// does not know returns `{}`.
pub fn fake_api(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route(
            "/api/2.0/mlflow/experiments/search",
            get(search_experiments).post(search_experiments),
        )
        .route(
            "/ajax-api/2.0/mlflow/experiments/search",
            get(search_experiments).post(search_experiments),
        )
        .route(
            "/api/2.0/mlflow/registered-models/search",
            get(search_registered_models),
        )
        .route(
            "/api/2.0/mlflow/logged-models/search",
            post(search_logged_models),
        )
        .route("/api/2.0/mlflow/experiments/create", post(create_experiment))
        .route("/api/2.0/mlflow/experiments/get", get(get_experiment))
        .route(
            "/api/2.0/mlflow/registered-models/create",
            post(create_registered_model),
        )
        .route(
            "/api/2.0/mlflow/registered-models/rename",
            post(rename_registered_model),
        )
        .route(
            "/api/2.0/mlflow/registered-models/delete",
            delete(|| async { Json(json!({})) }),
        )
        .fallback(|| async { Json(json!({})) })
        .with_state(store)
}

fn page_json(field: &str, page: Page) -> Value {
    let mut body = json!({});
    body[field] = Value::Array(page.items);
    if let Some(token) = page.next_page_token {
        body["next_page_token"] = Value::String(token);
    }
    body
}

async fn search_experiments(
    State(store): State<Arc<MemoryStore>>,
    params: RequestParams,
) -> Json<Value> {
    let query = ExperimentSearch::from_params(&params).unwrap();
    let token = params.get_opt("page_token");
    let page = store
        .search_experiments(&query, token.as_deref())
        .await
        .unwrap();
    Json(page_json("experiments", page))
}

async fn search_registered_models(
    State(store): State<Arc<MemoryStore>>,
    params: RequestParams,
) -> Json<Value> {
    let query = RegisteredModelSearch::from_params(&params).unwrap();
    let token = params.get_opt("page_token");
    let page = store
        .search_registered_models(&query, token.as_deref())
        .await
        .unwrap();
    Json(page_json("registered_models", page))
}

async fn search_logged_models(
    State(store): State<Arc<MemoryStore>>,
    params: RequestParams,
) -> Json<Value> {
    let query = LoggedModelSearch::from_params(&params).unwrap();
    let token = params.get_opt("page_token");
    let page = store
        .search_logged_models(&query, token.as_deref())
        .await
        .unwrap();
    Json(page_json("models", page))
}

async fn create_experiment(params: RequestParams) -> Response {
    if params.get_opt("name").as_deref() == Some(TAKEN_EXPERIMENT_NAME) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": "RESOURCE_ALREADY_EXISTS",
                "message": "Experiment 'taken' already exists."
            })),
        )
            .into_response();
    }
    Json(json!({ "experiment_id": CREATED_EXPERIMENT_ID })).into_response()
}

async fn get_experiment(params: RequestParams) -> Json<Value> {
    let id = params.get("experiment_id").unwrap();
    Json(json!({ "experiment": { "experiment_id": id } }))
}

async fn create_registered_model(params: RequestParams) -> Json<Value> {
    let name = params.get("name").unwrap();
    Json(json!({ "registered_model": { "name": name } }))
}

async fn rename_registered_model(params: RequestParams) -> Json<Value> {
    let new_name = params.get("new_name").unwrap();
    Json(json!({ "registered_model": { "name": new_name } }))
}
