//! Per-request authorization.
//!
//! Order of decisions: path decoding, unprotected path, authentication, admin bypass, route
//! classification, permission check. After the inner service answers, the
//! operation's hook runs on successful responses only.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::authz::authn::AuthOutcome;
use crate::authz::hooks::{self, HookOutcome};
use crate::authz::params::RequestParams;
use crate::authz::resolver::Resolver;
use crate::authz::routes::{self, AfterHook, Check, Target};
use crate::errors::GateError;
use crate::storage::{self, User};
use crate::web::AppContext;

pub async fn authorize(State(ctx): State<AppContext>, req: Request, next: Next) -> Response {
    match authorize_request(&ctx, req, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn authorize_request(
    ctx: &AppContext,
    req: Request,
    next: Next,
) -> Result<Response, GateError> {
    let path = routes::decode_path(req.uri().path())?;
    if routes::is_unprotected(&path) {
        return Ok(next.run(req).await);
    }

    let credentials = match ctx.authenticator.authenticate(req.headers(), &ctx.db).await? {
        AuthOutcome::Authenticated(credentials) => credentials,
        AuthOutcome::Challenge(response) => return Ok(response),
    };
    // Admin status is read fresh on every request
    let user = match storage::get_user(&ctx.db, &credentials.username).await {
        Ok(user) => user,
        Err(e) if e.is_not_found() => return Err(GateError::Unauthenticated),
        Err(e) => return Err(e),
    };

    let method = req.method().clone();
    let route = ctx.routes.find(&path, &method);
    let hook = route
        .as_ref()
        .and_then(|r| r.operation.after_hook())
        .filter(|h| hook_applies(*h, &user));
    let check = if user.is_admin {
        tracing::debug!(username = %user.username, %path, "admin bypass");
        None
    } else {
        route
            .as_ref()
            .and_then(|r| r.operation.check())
            .or_else(|| ctx.routes.artifact_check(&path, &method))
    };

    let (req, params) = if needs_params(check.as_ref(), hook) {
        let path_params = route.map(|r| r.path_params).unwrap_or_default();
        read_params(req, &path_params, ctx.settings.server.max_body_bytes).await?
    } else {
        (req, RequestParams::default())
    };

    if let Some(check) = &check {
        if !evaluate(ctx, check, &user, &params).await? {
            tracing::info!(
                username = %user.username,
                %method,
                %path,
                ?check,
                "permission denied"
            );
            return Err(GateError::Forbidden);
        }
        tracing::debug!(username = %user.username, %method, %path, "permission granted");
    }

    let response = next.run(req).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Ok(response);
    }

    match hook {
        Some(hook) => apply_hook(ctx, hook, &user, &params, response).await,
        None => Ok(response),
    }
}

/// Creator grants and filtering are skipped for admins; grant cleanup on
/// delete and rename runs for everyone.
fn hook_applies(hook: AfterHook, user: &User) -> bool {
    match hook {
        AfterHook::DropRegisteredModelGrants | AfterHook::RenameRegisteredModelGrants => true,
        _ => !user.is_admin,
    }
}

fn needs_params(check: Option<&Check>, hook: Option<AfterHook>) -> bool {
    let check_needs = match check {
        Some(Check::Resource {
            target: Target::ArtifactExperiment(_),
            ..
        }) => false,
        Some(Check::AdminOnly) | None => false,
        Some(_) => true,
    };
    let hook_needs = matches!(
        hook,
        Some(
            AfterHook::DropRegisteredModelGrants
                | AfterHook::RenameRegisteredModelGrants
                | AfterHook::FilterExperiments
                | AfterHook::FilterLoggedModels
                | AfterHook::FilterRegisteredModels
        )
    );
    check_needs || hook_needs
}

/// Read the request parameters, buffering the body when they live there and
/// handing the same bytes on to the inner service.
async fn read_params(
    req: Request,
    path_params: &[(String, String)],
    limit: usize,
) -> Result<(Request, RequestParams), GateError> {
    let (parts, body) = req.into_parts();
    let (body, bytes) = if RequestParams::needs_body(&parts.method, &parts.headers) {
        let bytes = axum::body::to_bytes(body, limit)
            .await
            .map_err(|e| GateError::BadRequest(format!("Failed to read request body: {e}")))?;
        (Body::from(bytes.clone()), bytes)
    } else {
        (body, Bytes::new())
    };

    let params = RequestParams::parse(
        &parts.method,
        &parts.headers,
        parts.uri.query(),
        &bytes,
        path_params,
    )?;
    Ok((Request::from_parts(parts, body), params))
}

async fn evaluate(
    ctx: &AppContext,
    check: &Check,
    user: &User,
    params: &RequestParams,
) -> Result<bool, GateError> {
    match check {
        Check::AdminOnly => Ok(user.is_admin),
        Check::SenderIsUser => Ok(params.get("username")? == user.username),
        Check::Resource { target, capability } => {
            let resolver = Resolver::new(&ctx.db, ctx.store.as_ref(), ctx.default_permission);
            let permission = resolver
                .effective_permission(target, params, &user.username)
                .await?;
            Ok(permission.allows(*capability))
        }
    }
}

async fn apply_hook(
    ctx: &AppContext,
    hook: AfterHook,
    user: &User,
    params: &RequestParams,
    response: Response,
) -> Result<Response, GateError> {
    let (mut parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GateError::Internal(format!("Failed to read upstream response: {e}")))?;
    let json: Value = serde_json::from_slice(&bytes)?;

    match hooks::run(ctx, hook, user, params, json).await? {
        HookOutcome::Unchanged => Ok(Response::from_parts(parts, Body::from(bytes))),
        HookOutcome::Rewritten(value) => {
            let rewritten = serde_json::to_vec(&value)?;
            parts.headers.remove(header::CONTENT_LENGTH);
            Ok(Response::from_parts(parts, Body::from(rewritten)))
        }
    }
}
