//! Pluggable request authentication, selected by name in configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::Response;
use base64ct::{Base64, Encoding};
use sea_orm::DatabaseConnection;

use crate::errors::{challenge_response, GateError};
use crate::storage;

/// Identity presented by an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

pub enum AuthOutcome {
    Authenticated(Credentials),
    /// Response to send instead of serving the request, usually a 401 challenge.
    Challenge(Response),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        db: &DatabaseConnection,
    ) -> Result<AuthOutcome, GateError>;
}

/// HTTP Basic credentials checked against the user store.
#[derive(Debug, Default)]
pub struct BasicAuth;

pub(crate) fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, b64) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = Base64::decode_vec(b64.trim()).ok()?;
    let s = String::from_utf8(decoded).ok()?;
    let (username, password) = s.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[async_trait]
impl Authenticator for BasicAuth {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        db: &DatabaseConnection,
    ) -> Result<AuthOutcome, GateError> {
        let Some((username, password)) = basic_credentials(headers) else {
            return Ok(AuthOutcome::Challenge(challenge_response()));
        };

        if storage::authenticate_user(db, &username, &password).await? {
            Ok(AuthOutcome::Authenticated(Credentials {
                username,
                password: Some(password),
            }))
        } else {
            tracing::debug!(%username, "basic authentication failed");
            Ok(AuthOutcome::Challenge(challenge_response()))
        }
    }
}

/// Trusts a username header set by an SSO proxy in front of the gateway.
#[derive(Debug)]
pub struct RemoteUserAuth {
    header: HeaderName,
}

impl Default for RemoteUserAuth {
    fn default() -> Self {
        Self {
            header: HeaderName::from_static("x-remote-user"),
        }
    }
}

#[async_trait]
impl Authenticator for RemoteUserAuth {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        db: &DatabaseConnection,
    ) -> Result<AuthOutcome, GateError> {
        let username = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let Some(username) = username else {
            return Ok(AuthOutcome::Challenge(challenge_response()));
        };
        if !storage::has_user(db, username).await? {
            tracing::debug!(%username, "remote user is not registered");
            return Ok(AuthOutcome::Challenge(challenge_response()));
        }
        Ok(AuthOutcome::Authenticated(Credentials {
            username: username.to_string(),
            password: None,
        }))
    }
}

static AUTHENTICATORS: OnceLock<Mutex<HashMap<String, Arc<dyn Authenticator>>>> = OnceLock::new();

/// Authenticator registered under `name`, memoized for the process lifetime.
pub fn resolve(name: &str) -> Result<Arc<dyn Authenticator>, GateError> {
    let registry = AUTHENTICATORS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry
        .lock()
        .map_err(|_| GateError::Internal("authenticator registry lock poisoned".to_string()))?;

    if let Some(found) = registry.get(name) {
        return Ok(found.clone());
    }

    let authenticator: Arc<dyn Authenticator> = match name {
        "basic" | "trackgate.authn:basic" => Arc::new(BasicAuth),
        "remote-user" | "trackgate.authn:remote_user" => Arc::new(RemoteUserAuth::default()),
        other => {
            return Err(GateError::Internal(format!(
                "Unsupported authorization function '{other}'"
            )))
        }
    };
    registry.insert(name.to_string(), authenticator.clone());
    Ok(authenticator)
}
