use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

/// Realm advertised in the `WWW-Authenticate` challenge.
pub const AUTH_REALM: &str = "trackgate";

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("Serialization error: {0}")]
    #[diagnostic(code(trackgate::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(trackgate::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Upstream request failed: {0}")]
    #[diagnostic(
        code(trackgate::upstream),
        help("Check that `upstream.url` points at a reachable tracking server")
    )]
    Upstream(#[from] reqwest::Error),

    #[error("Missing value for required parameter '{0}'")]
    #[diagnostic(code(trackgate::missing_parameter))]
    MissingParameter(String),

    #[error("Invalid parameter: {0}")]
    #[diagnostic(code(trackgate::invalid_parameter))]
    InvalidParameter(String),

    #[error("Invalid permission `{0}`")]
    #[diagnostic(
        code(trackgate::invalid_permission),
        help("Valid permissions are: READ, EDIT, UPDATE, MANAGE, NO_PERMISSIONS")
    )]
    InvalidPermissionLevel(String),

    #[error("{0}")]
    #[diagnostic(code(trackgate::not_found))]
    ResourceNotFound(String),

    #[error("{0}")]
    #[diagnostic(code(trackgate::already_exists))]
    AlreadyExists(String),

    #[error("Bad request: {0}")]
    #[diagnostic(code(trackgate::bad_request))]
    BadRequest(String),

    #[error("You are not authenticated")]
    #[diagnostic(code(trackgate::unauthenticated))]
    Unauthenticated,

    #[error("Permission denied")]
    #[diagnostic(code(trackgate::forbidden))]
    Forbidden,

    #[error("{0}")]
    #[diagnostic(code(trackgate::internal))]
    Internal(String),
}

impl GateError {
    /// Wire error code carried in JSON error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            GateError::MissingParameter(_)
            | GateError::InvalidParameter(_)
            | GateError::InvalidPermissionLevel(_) => "INVALID_PARAMETER_VALUE",
            GateError::ResourceNotFound(_) => "RESOURCE_DOES_NOT_EXIST",
            GateError::AlreadyExists(_) => "RESOURCE_ALREADY_EXISTS",
            GateError::BadRequest(_) => "BAD_REQUEST",
            GateError::Unauthenticated => "UNAUTHENTICATED",
            GateError::Forbidden => "PERMISSION_DENIED",
            _ => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::MissingParameter(_)
            | GateError::InvalidParameter(_)
            | GateError::InvalidPermissionLevel(_)
            | GateError::AlreadyExists(_)
            | GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GateError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            GateError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GateError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GateError::ResourceNotFound(_))
    }
}

/// 401 carrying a Basic challenge so clients can retry with credentials.
pub fn challenge_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{AUTH_REALM}\""),
        )],
        "You are not authenticated. Please provide valid credentials.",
    )
        .into_response()
}

/// 403 with a generic body so denials never reveal whether the resource exists.
pub fn forbidden_response() -> Response {
    (StatusCode::FORBIDDEN, "Permission denied").into_response()
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match &self {
            GateError::Unauthenticated => return challenge_response(),
            GateError::Forbidden => return forbidden_response(),
            _ => {}
        }
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "error_code": self.error_code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GateError::MissingParameter("name".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GateError::ResourceNotFound("gone".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(GateError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GateError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_missing_parameter_names_parameter() {
        let err = GateError::MissingParameter("experiment_id".into());
        assert!(err.to_string().contains("'experiment_id'"));
        assert_eq!(err.error_code(), "INVALID_PARAMETER_VALUE");
    }

    #[test]
    fn test_unauthenticated_carries_challenge() {
        let resp = GateError::Unauthenticated.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let challenge = resp
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(challenge, "Basic realm=\"trackgate\"");
    }
}
