//! The tracking server behind the gateway.
//!
//! [`Upstream::proxy`] forwards requests the gateway does not serve itself, and
//! [`RestStore`] answers the resource lookups authorization needs by calling
//! the same server's REST API.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};
use url::Url;

use crate::errors::GateError;
use crate::settings;
use crate::tracking::{
    ExperimentSearch, LoggedModelSearch, Page, RegisteredModelSearch, ResourceStore,
};

const RUNS_GET: &str = "/api/2.0/mlflow/runs/get";
const LOGGED_MODELS: &str = "/api/2.0/mlflow/logged-models";
const LOGGED_MODELS_SEARCH: &str = "/api/2.0/mlflow/logged-models/search";
const EXPERIMENTS_GET_BY_NAME: &str = "/api/2.0/mlflow/experiments/get-by-name";
const EXPERIMENTS_SEARCH: &str = "/api/2.0/mlflow/experiments/search";
const REGISTERED_MODELS_SEARCH: &str = "/api/2.0/mlflow/registered-models/search";

/// Headers that describe a single connection and are not forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base: Url,
}

impl Upstream {
    pub fn new(cfg: &settings::Upstream) -> Result<Self, GateError> {
        let base = Url::parse(&cfg.url).map_err(|e| {
            GateError::Internal(format!("Invalid upstream url '{}': {e}", cfg.url))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { client, base })
    }

    /// Absolute upstream URL for a gateway path (with optional query).
    /// A path prefix on the base URL is kept.
    fn url(&self, path_and_query: &str) -> Result<Url, GateError> {
        let joined = format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        );
        Url::parse(&joined)
            .map_err(|e| GateError::BadRequest(format!("Cannot forward '{path_and_query}': {e}")))
    }

    /// A service that forwards every request to the upstream server.
    pub fn proxy(self) -> Router {
        Router::new().fallback(forward).with_state(self)
    }

    /// A resource store backed by this upstream.
    pub fn store(&self) -> RestStore {
        RestStore {
            upstream: self.clone(),
        }
    }

    async fn forward(&self, req: Request) -> Result<Response, GateError> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = self.url(path_and_query)?;

        // Bounded by the body limit layer in `web::app`
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| GateError::BadRequest(format!("Failed to read request body: {e}")))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        // Credentials stay at the gateway
        headers.remove(header::AUTHORIZATION);

        tracing::debug!(method = %parts.method, %url, "forwarding to upstream");
        let resp = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, GateError> {
        let resp = request.send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }

        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("upstream returned {status}"));
        if status == StatusCode::NOT_FOUND {
            Err(GateError::ResourceNotFound(message))
        } else {
            tracing::error!(%status, %message, "upstream lookup failed");
            Err(GateError::Internal(message))
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, GateError> {
        let url = self.url(path)?;
        self.call(self.client.get(url).query(query)).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, GateError> {
        let url = self.url(path)?;
        self.call(self.client.post(url).json(body)).await
    }
}

async fn forward(State(upstream): State<Upstream>, req: Request) -> Response {
    match upstream.forward(req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn page_from(mut body: Value, field: &str) -> Page {
    let items = match body.get_mut(field).map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    let next_page_token = body
        .get("next_page_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Page {
        items,
        next_page_token,
    }
}

/// [`ResourceStore`] that reads from the upstream tracking server's REST API.
#[derive(Clone)]
pub struct RestStore {
    upstream: Upstream,
}

#[async_trait]
impl ResourceStore for RestStore {
    async fn run_experiment_id(&self, run_id: &str) -> Result<String, GateError> {
        let body = self.upstream.get_json(RUNS_GET, &[("run_id", run_id)]).await?;
        string_at(&body, "/run/info/experiment_id").ok_or_else(|| {
            GateError::Internal(format!("Run {run_id} has no experiment_id"))
        })
    }

    async fn logged_model_experiment_id(&self, model_id: &str) -> Result<String, GateError> {
        let path = format!("{LOGGED_MODELS}/{model_id}");
        let body = self.upstream.get_json(&path, &[]).await?;
        string_at(&body, "/model/info/experiment_id").ok_or_else(|| {
            GateError::Internal(format!("Logged model {model_id} has no experiment_id"))
        })
    }

    async fn experiment_id_by_name(&self, name: &str) -> Result<Option<String>, GateError> {
        match self
            .upstream
            .get_json(EXPERIMENTS_GET_BY_NAME, &[("experiment_name", name)])
            .await
        {
            Ok(body) => Ok(string_at(&body, "/experiment/experiment_id")),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search_experiments(
        &self,
        query: &ExperimentSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        let body = json!({
            "max_results": query.max_results,
            "filter": query.filter,
            "order_by": query.order_by,
            "view_type": query.view_type,
            "page_token": page_token,
        });
        let resp = self.upstream.post_json(EXPERIMENTS_SEARCH, &body).await?;
        Ok(page_from(resp, "experiments"))
    }

    async fn search_registered_models(
        &self,
        query: &RegisteredModelSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        let max_results = query.max_results.to_string();
        let mut params = vec![("max_results", max_results.as_str())];
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.as_str()));
        }
        for order_by in &query.order_by {
            params.push(("order_by", order_by.as_str()));
        }
        if let Some(token) = page_token {
            params.push(("page_token", token));
        }
        let resp = self
            .upstream
            .get_json(REGISTERED_MODELS_SEARCH, &params)
            .await?;
        Ok(page_from(resp, "registered_models"))
    }

    async fn search_logged_models(
        &self,
        query: &LoggedModelSearch,
        page_token: Option<&str>,
    ) -> Result<Page, GateError> {
        let body = json!({
            "experiment_ids": query.experiment_ids,
            "filter": query.filter_string,
            "order_by": query.order_by,
            "max_results": query.max_results,
            "page_token": page_token,
        });
        let resp = self.upstream.post_json(LOGGED_MODELS_SEARCH, &body).await?;
        Ok(page_from(resp, "models"))
    }
}
