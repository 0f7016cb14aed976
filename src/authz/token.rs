use base64ct::{Base64, Encoding};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::GateError;

/// A continuation cursor handed to clients as an opaque string.
///
/// Tokens are standard base64 over a JSON document, so a token issued by one
/// gateway instance can be replayed against any other.
pub trait PageToken: Sized {
    fn encode(&self) -> Result<String, GateError>;
    fn decode(token: &str) -> Result<Self, GateError>;
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, GateError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64::encode_string(&json))
}

fn decode_json<T: DeserializeOwned>(token: &str) -> Result<T, GateError> {
    let bytes = Base64::decode_vec(token.trim()).map_err(|_| {
        GateError::InvalidParameter(format!("Invalid page token, could not base64-decode: {token}"))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        GateError::InvalidParameter(format!("Invalid page token, could not parse JSON: {e}"))
    })
}

/// Plain offset cursor used by experiment and registered model searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetToken {
    pub offset: u64,
}

impl OffsetToken {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Starting offset for an optional client token; absent or empty means 0.
    pub fn start_offset(token: Option<&str>) -> Result<u64, GateError> {
        match token {
            None => Ok(0),
            Some(t) if t.is_empty() => Ok(0),
            Some(t) => Ok(Self::decode(t)?.offset),
        }
    }
}

impl PageToken for OffsetToken {
    fn encode(&self) -> Result<String, GateError> {
        encode_json(self)
    }

    fn decode(token: &str) -> Result<Self, GateError> {
        decode_json(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderBy {
    pub field_name: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub dataset_digest: Option<String>,
}

fn default_ascending() -> bool {
    true
}

/// Logged model searches carry their original arguments inside the cursor so
/// every follow-up backend call is argument-identical to the first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoggedModelsToken {
    pub offset: u64,
    pub experiment_ids: Vec<String>,
    pub filter_string: Option<String>,
    pub order_by: Option<Vec<OrderBy>>,
}

impl PageToken for LoggedModelsToken {
    fn encode(&self) -> Result<String, GateError> {
        encode_json(self)
    }

    fn decode(token: &str) -> Result<Self, GateError> {
        decode_json(token)
    }
}
