//! Read-only view of the tracking server the gateway protects.

use async_trait::async_trait;
use serde_json::Value;

use crate::authz::params::RequestParams;
use crate::authz::token::OrderBy;
use crate::errors::GateError;

pub const DEFAULT_EXPERIMENTS_MAX_RESULTS: u64 = 1000;
pub const DEFAULT_REGISTERED_MODELS_MAX_RESULTS: u64 = 100;
pub const DEFAULT_LOGGED_MODELS_MAX_RESULTS: u64 = 100;

/// One page of search results, rows kept as the JSON the API returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// `None` once the backend has no further rows.
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExperimentSearch {
    pub max_results: u64,
    pub filter: Option<String>,
    pub order_by: Vec<String>,
    pub view_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisteredModelSearch {
    pub max_results: u64,
    pub filter: Option<String>,
    pub order_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoggedModelSearch {
    pub max_results: u64,
    pub experiment_ids: Vec<String>,
    pub filter_string: Option<String>,
    pub order_by: Option<Vec<OrderBy>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl ExperimentSearch {
    pub fn from_params(params: &RequestParams) -> Result<Self, GateError> {
        Ok(Self {
            max_results: params
                .get_u64("max_results")?
                .unwrap_or(DEFAULT_EXPERIMENTS_MAX_RESULTS),
            filter: non_empty(params.get_opt("filter")),
            order_by: params.get_list("order_by"),
            view_type: non_empty(params.get_opt("view_type")),
        })
    }
}

impl RegisteredModelSearch {
    pub fn from_params(params: &RequestParams) -> Result<Self, GateError> {
        Ok(Self {
            max_results: params
                .get_u64("max_results")?
                .unwrap_or(DEFAULT_REGISTERED_MODELS_MAX_RESULTS),
            filter: non_empty(params.get_opt("filter")),
            order_by: params.get_list("order_by"),
        })
    }
}

impl LoggedModelSearch {
    pub fn from_params(params: &RequestParams) -> Result<Self, GateError> {
        let order_by = match params.raw("order_by") {
            Some(Value::Array(items)) if !items.is_empty() => Some(
                serde_json::from_value::<Vec<OrderBy>>(Value::Array(items.clone())).map_err(
                    |e| GateError::InvalidParameter(format!("Invalid order_by: {e}")),
                )?,
            ),
            _ => None,
        };
        Ok(Self {
            max_results: params
                .get_u64("max_results")?
                .unwrap_or(DEFAULT_LOGGED_MODELS_MAX_RESULTS),
            experiment_ids: params.get_list("experiment_ids"),
            filter_string: non_empty(params.get_opt("filter")),
            order_by,
        })
    }
}

/// Backend lookups the authorization layer needs.
///
/// Lookups of a run or logged model that does not exist fail with
/// [`GateError::ResourceNotFound`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn run_experiment_id(&self, run_id: &str) -> Result<String, GateError>;

    async fn logged_model_experiment_id(&self, model_id: &str) -> Result<String, GateError>;

    /// `Ok(None)` when no experiment has this name.
    async fn experiment_id_by_name(&self, name: &str) -> Result<Option<String>, GateError>;

    async fn search_experiments(
        &self,
        query: &ExperimentSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError>;

    async fn search_registered_models(
        &self,
        query: &RegisteredModelSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError>;

    async fn search_logged_models(
        &self,
        query: &LoggedModelSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError>;
}

pub mod memory {
    //! In-process store used by tests and embedders that own the data.
    //! Filter and order expressions are not evaluated; rows come back in
    //! insertion order.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{ExperimentSearch, LoggedModelSearch, Page, RegisteredModelSearch, ResourceStore};
    use crate::authz::token::{LoggedModelsToken, OffsetToken, PageToken};
    use crate::errors::GateError;

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        experiments: Vec<Value>,
        runs: HashMap<String, String>,
        logged_models: Vec<Value>,
        registered_models: Vec<Value>,
        search_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_experiment(mut self, experiment_id: &str, name: &str) -> Self {
            self.experiments
                .push(json!({ "experiment_id": experiment_id, "name": name }));
            self
        }

        pub fn with_run(mut self, run_id: &str, experiment_id: &str) -> Self {
            self.runs
                .insert(run_id.to_string(), experiment_id.to_string());
            self
        }

        pub fn with_logged_model(mut self, model_id: &str, experiment_id: &str) -> Self {
            self.logged_models.push(json!({
                "info": {
                    "model_id": model_id,
                    "experiment_id": experiment_id,
                    "name": model_id,
                }
            }));
            self
        }

        pub fn with_registered_model(mut self, name: &str) -> Self {
            self.registered_models.push(json!({ "name": name }));
            self
        }

        /// Number of search calls served so far.
        pub fn search_calls(&self) -> usize {
            self.search_calls.load(Ordering::SeqCst)
        }

        fn page(rows: &[Value], offset: u64, max_results: u64) -> (Vec<Value>, bool) {
            let start = (offset as usize).min(rows.len());
            let end = start.saturating_add(max_results as usize).min(rows.len());
            (rows[start..end].to_vec(), end < rows.len())
        }

        fn offset_page(
            &self,
            rows: &[Value],
            max_results: u64,
            page_token: Option<&str>,
        ) -> Result<Page, GateError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            let offset = OffsetToken::start_offset(page_token)?;
            let (items, more) = Self::page(rows, offset, max_results);
            let next_page_token = if more {
                Some(OffsetToken::new(offset + items.len() as u64).encode()?)
            } else {
                None
            };
            Ok(Page {
                items,
                next_page_token,
            })
        }
    }

    #[async_trait]
    impl ResourceStore for MemoryStore {
        async fn run_experiment_id(&self, run_id: &str) -> Result<String, GateError> {
            self.runs.get(run_id).cloned().ok_or_else(|| {
                GateError::ResourceNotFound(format!("Run with id={run_id} not found"))
            })
        }

        async fn logged_model_experiment_id(&self, model_id: &str) -> Result<String, GateError> {
            self.logged_models
                .iter()
                .find(|m| m["info"]["model_id"] == model_id)
                .and_then(|m| m["info"]["experiment_id"].as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    GateError::ResourceNotFound(format!("Logged model with id={model_id} not found"))
                })
        }

        async fn experiment_id_by_name(&self, name: &str) -> Result<Option<String>, GateError> {
            Ok(self
                .experiments
                .iter()
                .find(|e| e["name"] == name)
                .and_then(|e| e["experiment_id"].as_str())
                .map(str::to_string))
        }

        async fn search_experiments(
            &self,
            query: &ExperimentSearch,
            page_token: Option<&str>,
        ) -> Result<Page, GateError> {
            self.offset_page(&self.experiments, query.max_results, page_token)
        }

        async fn search_registered_models(
            &self,
            query: &RegisteredModelSearch,
            page_token: Option<&str>,
        ) -> Result<Page, GateError> {
            self.offset_page(&self.registered_models, query.max_results, page_token)
        }

        async fn search_logged_models(
            &self,
            query: &LoggedModelSearch,
            page_token: Option<&str>,
        ) -> Result<Page, GateError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            let offset = match page_token {
                Some(t) if !t.is_empty() => LoggedModelsToken::decode(t)?.offset,
                _ => 0,
            };
            let rows: Vec<Value> = self
                .logged_models
                .iter()
                .filter(|m| {
                    query.experiment_ids.is_empty()
                        || m["info"]["experiment_id"]
                            .as_str()
                            .is_some_and(|id| query.experiment_ids.iter().any(|e| e == id))
                })
                .cloned()
                .collect();

            let (items, more) = Self::page(&rows, offset, query.max_results);
            let next_page_token = if more {
                let token = LoggedModelsToken {
                    offset: offset + items.len() as u64,
                    experiment_ids: query.experiment_ids.clone(),
                    filter_string: query.filter_string.clone(),
                    order_by: query.order_by.clone(),
                };
                Some(token.encode()?)
            } else {
                None
            };
            Ok(Page {
                items,
                next_page_token,
            })
        }
    }

}
