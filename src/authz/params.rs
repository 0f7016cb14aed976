use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderMap, Method};
use serde_json::{Map, Value};

use crate::errors::GateError;

/// Parameters of a single request, merged from the query string or JSON body
/// and the identifiers captured from the path.
///
/// Path captures win over body and query values with the same name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    values: Map<String, Value>,
}

impl RequestParams {
    /// Build the parameter set the way the tracking API reads it: GET from the
    /// query string, POST and PATCH from the JSON body, DELETE from the body
    /// when it is JSON and from the query string otherwise.
    pub fn parse(
        method: &Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: &[u8],
        path_params: &[(String, String)],
    ) -> Result<Self, GateError> {
        let mut values = match *method {
            Method::GET => parse_query(query),
            Method::POST | Method::PATCH => parse_json_body(body)?,
            Method::DELETE if is_json(headers) => parse_json_body(body)?,
            Method::DELETE => parse_query(query),
            _ => {
                return Err(GateError::BadRequest(format!(
                    "Unsupported HTTP method '{method}'"
                )))
            }
        };

        for (name, value) in path_params {
            values.insert(name.clone(), Value::String(value.clone()));
        }
        Ok(Self { values })
    }

    /// Whether building params for `method` needs the request body.
    pub fn needs_body(method: &Method, headers: &HeaderMap) -> bool {
        match *method {
            Method::POST | Method::PATCH => true,
            Method::DELETE => is_json(headers),
            _ => false,
        }
    }

    /// Required parameter as a string. `run_id` falls back to the legacy
    /// `run_uuid` name.
    pub fn get(&self, name: &str) -> Result<String, GateError> {
        if let Some(value) = self.values.get(name).and_then(scalar_to_string) {
            return Ok(value);
        }
        if name == "run_id" {
            return self.get("run_uuid");
        }
        Err(GateError::MissingParameter(name.to_string()))
    }

    pub fn get_opt(&self, name: &str) -> Option<String> {
        self.values.get(name).and_then(scalar_to_string)
    }

    /// All values for a parameter that may repeat (`order_by`, `experiment_ids`).
    pub fn get_list(&self, name: &str) -> Vec<String> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
            Some(other) => scalar_to_string(other).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, GateError> {
        match self.get_opt(name) {
            None => Ok(None),
            Some(s) => s.parse::<u64>().map(Some).map_err(|_| {
                GateError::InvalidParameter(format!("'{name}' must be a non-negative integer, got '{s}'"))
            }),
        }
    }
}

/// Handlers read their parameters with the same rules the checks use.
impl<S: Send + Sync> FromRequest<S> for RequestParams {
    type Rejection = GateError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let bytes = if RequestParams::needs_body(&parts.method, &parts.headers) {
            axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| GateError::BadRequest(format!("Failed to read request body: {e}")))?
        } else {
            Bytes::new()
        };
        RequestParams::parse(&parts.method, &parts.headers, parts.uri.query(), &bytes, &[])
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let mime = ct.split(';').next().unwrap_or("").trim();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        // Repeated query keys: the first value is the parameter's value
        Value::Array(items) => items.first().and_then(scalar_to_string),
        _ => None,
    }
}

fn parse_query(query: Option<&str>) -> Map<String, Value> {
    let mut values = Map::new();
    let Some(query) = query else {
        return values;
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match values.get_mut(key.as_ref()) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                values.insert(key.into_owned(), value);
            }
        }
    }
    values
}

fn parse_json_body(body: &[u8]) -> Result<Map<String, Value>, GateError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(GateError::BadRequest(
            "Request body must be a JSON object".to_string(),
        )),
        Err(e) => Err(GateError::BadRequest(format!("Invalid JSON body: {e}"))),
    }
}
