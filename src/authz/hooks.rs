//! Grant bookkeeping and result filtering that run after a successful response.

use serde_json::Value;

use crate::authz::filter::{self, Readability};
use crate::authz::params::RequestParams;
use crate::authz::permissions::Permission;
use crate::authz::routes::AfterHook;
use crate::errors::GateError;
use crate::storage::{self, User};
use crate::tracking::{ExperimentSearch, LoggedModelSearch, RegisteredModelSearch};
use crate::web::AppContext;

/// What a hook did with the response body.
#[derive(Debug, PartialEq)]
pub enum HookOutcome {
    Unchanged,
    Rewritten(Value),
}

fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Run `hook` for a successful response. `body` is the parsed response JSON.
pub async fn run(
    ctx: &AppContext,
    hook: AfterHook,
    user: &User,
    params: &RequestParams,
    body: Value,
) -> Result<HookOutcome, GateError> {
    let db = &ctx.db;

    match hook {
        AfterHook::GrantExperimentManage => {
            if user.is_admin {
                return Ok(HookOutcome::Unchanged);
            }
            let experiment_id = id_field(body.get("experiment_id")).ok_or_else(|| {
                GateError::Internal("create experiment response has no experiment_id".to_string())
            })?;
            storage::create_experiment_permission(
                db,
                &experiment_id,
                &user.username,
                Permission::Manage.name(),
            )
            .await?;
            tracing::info!(%experiment_id, username = %user.username, "granted MANAGE to experiment creator");
        }
        AfterHook::GrantRegisteredModelManage => {
            if user.is_admin {
                return Ok(HookOutcome::Unchanged);
            }
            let name = id_field(body.pointer("/registered_model/name")).ok_or_else(|| {
                GateError::Internal(
                    "create registered model response has no registered_model.name".to_string(),
                )
            })?;
            storage::create_registered_model_permission(
                db,
                &name,
                &user.username,
                Permission::Manage.name(),
            )
            .await?;
            tracing::info!(%name, username = %user.username, "granted MANAGE to registered model creator");
        }
        AfterHook::DropRegisteredModelGrants => {
            // Grants are keyed by name alone, so every user's grant goes
            let name = params.get("name")?;
            let removed = storage::delete_registered_model_permissions(db, &name).await?;
            tracing::info!(%name, removed, "dropped grants of deleted registered model");
        }
        AfterHook::RenameRegisteredModelGrants => {
            let name = params.get("name")?;
            let new_name = params.get("new_name")?;
            let moved = storage::rename_registered_model_permissions(db, &name, &new_name).await?;
            tracing::info!(%name, %new_name, moved, "moved grants of renamed registered model");
        }
        AfterHook::FilterExperiments
        | AfterHook::FilterLoggedModels
        | AfterHook::FilterRegisteredModels => {
            if user.is_admin {
                return Ok(HookOutcome::Unchanged);
            }
            return filter_response(ctx, hook, user, params, body)
                .await
                .map(HookOutcome::Rewritten);
        }
    }
    Ok(HookOutcome::Unchanged)
}

async fn filter_response(
    ctx: &AppContext,
    hook: AfterHook,
    user: &User,
    params: &RequestParams,
    body: Value,
) -> Result<Value, GateError> {
    let store = ctx.store.as_ref();
    let default = ctx.default_permission;

    match hook {
        AfterHook::FilterExperiments => {
            let readable = Readability::for_experiments(&ctx.db, &user.username, default).await?;
            let query = ExperimentSearch::from_params(params)?;
            filter::filter_experiments(store, &readable, &query, body).await
        }
        AfterHook::FilterLoggedModels => {
            let readable = Readability::for_experiments(&ctx.db, &user.username, default).await?;
            let query = LoggedModelSearch::from_params(params)?;
            filter::filter_logged_models(store, &readable, &query, body).await
        }
        AfterHook::FilterRegisteredModels => {
            let readable =
                Readability::for_registered_models(&ctx.db, &user.username, default).await?;
            let query = RegisteredModelSearch::from_params(params)?;
            filter::filter_registered_models(store, &readable, &query, body).await
        }
        _ => Ok(body),
    }
}
