//! Redaction of search responses down to the rows a user may read.
//!
//! Filtering shrinks a page, so the filter refills it from the backend and
//! rewrites the continuation token to the backend offset it actually consumed.
//! A replayed token therefore resumes at the first row this user has not seen.

use std::collections::HashMap;

use sea_orm::DatabaseConnection;
use serde_json::Value;

use crate::authz::permissions::Permission;
use crate::authz::token::{LoggedModelsToken, OffsetToken, PageToken};
use crate::errors::GateError;
use crate::storage;
use crate::tracking::{
    ExperimentSearch, LoggedModelSearch, Page, RegisteredModelSearch, ResourceStore,
};

/// Read access per resource key, with the default for keys without a grant.
#[derive(Debug, Clone)]
pub struct Readability {
    by_key: HashMap<String, bool>,
    default: bool,
}

impl Readability {
    pub fn new(by_key: HashMap<String, bool>, default_permission: Permission) -> Self {
        Self {
            by_key,
            default: default_permission.capabilities().can_read,
        }
    }

    pub async fn for_experiments(
        db: &DatabaseConnection,
        username: &str,
        default_permission: Permission,
    ) -> Result<Self, GateError> {
        let by_key = storage::list_experiment_permissions(db, username)
            .await?
            .into_iter()
            .map(|p| (p.experiment_id, p.permission.capabilities().can_read))
            .collect();
        Ok(Self::new(by_key, default_permission))
    }

    pub async fn for_registered_models(
        db: &DatabaseConnection,
        username: &str,
        default_permission: Permission,
    ) -> Result<Self, GateError> {
        let by_key = storage::list_registered_model_permissions(db, username)
            .await?
            .into_iter()
            .map(|p| (p.name, p.permission.capabilities().can_read))
            .collect();
        Ok(Self::new(by_key, default_permission))
    }

    pub fn can_read(&self, key: Option<&str>) -> bool {
        match key {
            Some(k) => self.by_key.get(k).copied().unwrap_or(self.default),
            None => self.default,
        }
    }
}

fn key_of<'v>(row: &'v Value, pointer: &str) -> Option<&'v str> {
    row.pointer(pointer).and_then(Value::as_str)
}

fn take_rows(response: &mut Value, field: &str) -> Vec<Value> {
    match response.get_mut(field).map(Value::take) {
        Some(Value::Array(rows)) => rows,
        _ => Vec::new(),
    }
}

fn current_token(response: &Value) -> Option<String> {
    response
        .get("next_page_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn finish(mut response: Value, field: &str, rows: Vec<Value>, token: Option<String>) -> Value {
    if let Some(obj) = response.as_object_mut() {
        obj.insert(field.to_string(), Value::Array(rows));
        match token {
            Some(t) => {
                obj.insert("next_page_token".to_string(), Value::String(t));
            }
            None => {
                obj.remove("next_page_token");
            }
        }
    }
    response
}

/// Searches paged with a plain offset token.
enum OffsetSearch<'q> {
    Experiments(&'q ExperimentSearch),
    RegisteredModels(&'q RegisteredModelSearch),
}

impl OffsetSearch<'_> {
    fn field(&self) -> &'static str {
        match self {
            OffsetSearch::Experiments(_) => "experiments",
            OffsetSearch::RegisteredModels(_) => "registered_models",
        }
    }

    fn key_pointer(&self) -> &'static str {
        match self {
            OffsetSearch::Experiments(_) => "/experiment_id",
            OffsetSearch::RegisteredModels(_) => "/name",
        }
    }

    fn max_results(&self) -> usize {
        match self {
            OffsetSearch::Experiments(q) => q.max_results as usize,
            OffsetSearch::RegisteredModels(q) => q.max_results as usize,
        }
    }

    async fn fetch(&self, store: &dyn ResourceStore, token: &str) -> Result<Page, GateError> {
        match self {
            OffsetSearch::Experiments(q) => store.search_experiments(q, Some(token)).await,
            OffsetSearch::RegisteredModels(q) => {
                store.search_registered_models(q, Some(token)).await
            }
        }
    }
}

async fn filter_offset_paged(
    store: &dyn ResourceStore,
    readable: &Readability,
    search: OffsetSearch<'_>,
    mut response: Value,
) -> Result<Value, GateError> {
    let field = search.field();
    let pointer = search.key_pointer();
    let max_results = search.max_results();

    let mut rows = take_rows(&mut response, field);
    let before = rows.len();
    rows.retain(|row| readable.can_read(key_of(row, pointer)));
    tracing::debug!(field, removed = before - rows.len(), "filtered unreadable rows");

    let mut token = current_token(&response);
    while rows.len() < max_results {
        let Some(current) = token.as_deref() else {
            break;
        };
        let mut batch = search.fetch(store, current).await?.items;
        batch.truncate(max_results - rows.len());
        if batch.is_empty() {
            token = None;
            break;
        }

        let start = OffsetToken::start_offset(Some(current))?;
        let consumed = batch.len() as u64;
        rows.extend(
            batch
                .into_iter()
                .filter(|row| readable.can_read(key_of(row, pointer))),
        );
        token = Some(OffsetToken::new(start + consumed).encode()?);
    }

    Ok(finish(response, field, rows, token))
}

/// Filter a `experiments/search` response.
pub async fn filter_experiments(
    store: &dyn ResourceStore,
    readable: &Readability,
    query: &ExperimentSearch,
    response: Value,
) -> Result<Value, GateError> {
    filter_offset_paged(store, readable, OffsetSearch::Experiments(query), response).await
}

/// Filter a `registered-models/search` response.
pub async fn filter_registered_models(
    store: &dyn ResourceStore,
    readable: &Readability,
    query: &RegisteredModelSearch,
    response: Value,
) -> Result<Value, GateError> {
    filter_offset_paged(
        store,
        readable,
        OffsetSearch::RegisteredModels(query),
        response,
    )
    .await
}

/// Filter a `logged-models/search` response.
///
/// Logged model rows are readable through their experiment. The backend's
/// last-page signal ends the walk without another round-trip, and the final
/// token is dropped when nothing is left.
pub async fn filter_logged_models(
    store: &dyn ResourceStore,
    readable: &Readability,
    query: &LoggedModelSearch,
    mut response: Value,
) -> Result<Value, GateError> {
    const FIELD: &str = "models";
    const KEY: &str = "/info/experiment_id";

    let max_results = query.max_results as usize;
    let token_at = |offset: u64| {
        LoggedModelsToken {
            offset,
            experiment_ids: query.experiment_ids.clone(),
            filter_string: query.filter_string.clone(),
            order_by: query.order_by.clone(),
        }
        .encode()
    };

    let mut rows = take_rows(&mut response, FIELD);
    rows.retain(|row| readable.can_read(key_of(row, KEY)));

    let mut next = current_token(&response);
    while rows.len() < max_results {
        let Some(current) = next.take() else {
            break;
        };
        let batch = store.search_logged_models(query, Some(&current)).await?;
        let is_last_page = batch.next_page_token.is_none();
        let offset = LoggedModelsToken::decode(&current)?.offset;
        let last_index = batch.items.len().saturating_sub(1);

        let mut filled = false;
        for (index, row) in batch.items.into_iter().enumerate() {
            if !readable.can_read(key_of(&row, KEY)) {
                continue;
            }
            rows.push(row);
            if rows.len() >= max_results {
                next = if is_last_page && index == last_index {
                    None
                } else {
                    Some(token_at(offset + index as u64 + 1)?)
                };
                filled = true;
                break;
            }
        }
        if !filled {
            next = if is_last_page {
                None
            } else {
                Some(token_at(offset + max_results as u64)?)
            };
        }
    }

    Ok(finish(response, FIELD, rows, next))
}
