//! HTTP surface of the gateway.
//!
//! The user and permission management API is served here. Every other request
//! falls through to the inner API service (the upstream proxy in production).
//! The authorization middleware wraps both.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use tower::Service;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::authz::authn::{self, Authenticator};
use crate::authz::middleware::authorize;
use crate::authz::params::RequestParams;
use crate::authz::permissions::Permission;
use crate::authz::routes::{management, RouteTable};
use crate::errors::GateError;
use crate::settings::Settings;
use crate::storage;
use crate::tracking::ResourceStore;
use crate::upstream::Upstream;

/// Shared, read-only state of a running gateway.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub store: Arc<dyn ResourceStore>,
    pub routes: Arc<RouteTable>,
    pub authenticator: Arc<dyn Authenticator>,
    pub default_permission: Permission,
}

impl AppContext {
    pub fn new(
        settings: Settings,
        db: DatabaseConnection,
        store: Arc<dyn ResourceStore>,
    ) -> miette::Result<Self> {
        let default_permission = settings.default_permission()?;
        let authenticator = authn::resolve(&settings.auth.authorization_function)?;
        Ok(Self {
            settings: Arc::new(settings),
            db,
            store,
            routes: Arc::new(RouteTable::new()),
            authenticator,
            default_permission,
        })
    }
}

/// Build the gateway router around `api`, the service that answers every
/// request not handled locally.
///
/// Request bodies above `server.max_body_bytes` are refused with 413 before
/// authentication, for local and forwarded routes alike.
pub fn app<S>(ctx: AppContext, api: S) -> Router
where
    S: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route(management::CREATE_USER, post(create_user))
        .route(management::GET_USER, get(get_user))
        .route(management::UPDATE_USER_PASSWORD, patch(update_user_password))
        .route(management::UPDATE_USER_ADMIN, patch(update_user_admin))
        .route(management::DELETE_USER, delete(delete_user))
        .route(
            management::CREATE_EXPERIMENT_PERMISSION,
            post(create_experiment_permission),
        )
        .route(
            management::GET_EXPERIMENT_PERMISSION,
            get(get_experiment_permission),
        )
        .route(
            management::UPDATE_EXPERIMENT_PERMISSION,
            patch(update_experiment_permission),
        )
        .route(
            management::DELETE_EXPERIMENT_PERMISSION,
            delete(delete_experiment_permission),
        )
        .route(
            management::CREATE_REGISTERED_MODEL_PERMISSION,
            post(create_registered_model_permission),
        )
        .route(
            management::GET_REGISTERED_MODEL_PERMISSION,
            get(get_registered_model_permission),
        )
        .route(
            management::UPDATE_REGISTERED_MODEL_PERMISSION,
            patch(update_registered_model_permission),
        )
        .route(
            management::DELETE_REGISTERED_MODEL_PERMISSION,
            delete(delete_registered_model_permission),
        )
        .fallback_service(api)
        .layer(middleware::from_fn_with_state(ctx.clone(), authorize))
        .layer(RequestBodyLimitLayer::new(ctx.settings.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let upstream = Upstream::new(&settings.upstream)?;
    let store: Arc<dyn ResourceStore> = Arc::new(upstream.store());
    let ctx = AppContext::new(settings, db, store)?;

    let addr: SocketAddr = ctx
        .settings
        .listen_addr()
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;
    tracing::info!(
        %addr,
        upstream = %ctx.settings.upstream.url,
        authorization_function = %ctx.settings.auth.authorization_function,
        "Gateway listening"
    );

    let router = app(ctx, upstream.proxy());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

fn parse_bool(name: &str, value: &str) -> Result<bool, GateError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(GateError::InvalidParameter(format!(
            "'{name}' must be true or false, got '{value}'"
        ))),
    }
}

// Users

async fn create_user(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(GateError::BadRequest(format!(
            "Invalid content type: '{content_type}'"
        )));
    }

    let username = params.get("username")?;
    let password = params.get("password")?;
    storage::create_user(&ctx.db, &username, &password, false).await?;
    tracing::info!(%username, "created user");

    let details = storage::get_user_details(&ctx.db, &username).await?;
    Ok(Json(json!({ "user": details })))
}

async fn get_user(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let username = params.get("username")?;
    let details = storage::get_user_details(&ctx.db, &username).await?;
    Ok(Json(json!({ "user": details })))
}

async fn update_user_password(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let username = params.get("username")?;
    let password = params.get("password")?;
    storage::update_user(&ctx.db, &username, Some(&password), None).await?;
    tracing::info!(%username, "updated user password");
    Ok(Json(json!({})))
}

async fn update_user_admin(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let username = params.get("username")?;
    let is_admin = parse_bool("is_admin", &params.get("is_admin")?)?;
    storage::update_user(&ctx.db, &username, None, Some(is_admin)).await?;
    tracing::info!(%username, is_admin, "updated user admin flag");
    Ok(Json(json!({})))
}

async fn delete_user(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let username = params.get("username")?;
    storage::delete_user(&ctx.db, &username).await?;
    tracing::info!(%username, "deleted user");
    Ok(Json(json!({})))
}

// Experiment grants

async fn create_experiment_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let experiment_id = params.get("experiment_id")?;
    let username = params.get("username")?;
    let permission = params.get("permission")?;
    let grant =
        storage::create_experiment_permission(&ctx.db, &experiment_id, &username, &permission)
            .await?;
    Ok(Json(json!({ "experiment_permission": grant })))
}

async fn get_experiment_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let experiment_id = params.get("experiment_id")?;
    let username = params.get("username")?;
    let grant = storage::get_experiment_permission(&ctx.db, &experiment_id, &username).await?;
    Ok(Json(json!({ "experiment_permission": grant })))
}

async fn update_experiment_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let experiment_id = params.get("experiment_id")?;
    let username = params.get("username")?;
    let permission = params.get("permission")?;
    storage::update_experiment_permission(&ctx.db, &experiment_id, &username, &permission)
        .await?;
    Ok(Json(json!({})))
}

async fn delete_experiment_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let experiment_id = params.get("experiment_id")?;
    let username = params.get("username")?;
    storage::delete_experiment_permission(&ctx.db, &experiment_id, &username).await?;
    Ok(Json(json!({})))
}

// Registered model grants

async fn create_registered_model_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let name = params.get("name")?;
    let username = params.get("username")?;
    let permission = params.get("permission")?;
    let grant =
        storage::create_registered_model_permission(&ctx.db, &name, &username, &permission)
            .await?;
    Ok(Json(json!({ "registered_model_permission": grant })))
}

async fn get_registered_model_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let name = params.get("name")?;
    let username = params.get("username")?;
    let grant = storage::get_registered_model_permission(&ctx.db, &name, &username).await?;
    Ok(Json(json!({ "registered_model_permission": grant })))
}

async fn update_registered_model_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let name = params.get("name")?;
    let username = params.get("username")?;
    let permission = params.get("permission")?;
    storage::update_registered_model_permission(&ctx.db, &name, &username, &permission).await?;
    Ok(Json(json!({})))
}

async fn delete_registered_model_permission(
    State(ctx): State<AppContext>,
    params: RequestParams,
) -> Result<Json<Value>, GateError> {
    let name = params.get("name")?;
    let username = params.get("username")?;
    storage::delete_registered_model_permission(&ctx.db, &name, &username).await?;
    Ok(Json(json!({})))
}
