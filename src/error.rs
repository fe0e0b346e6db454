use axum::{
    Json,
    body::Body,
    http::StatusCode,
    http::header,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error("internal server error")]
    Internal,
}

impl GatewayError {
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::http(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::http(StatusCode::CONFLICT, message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http { status, .. } => *status,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Internal => "unknown error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();
        let body = serde_json::to_vec(&ErrorBody { error: &message })
            .unwrap_or_else(|_| b"{\"error\":\"unknown error\"}".to_vec());
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, crate::constants::HEADER_JSON)
            .body(Body::from(body))
            .unwrap_or_else(|_| {
                let fallback = Json(ErrorBody {
                    error: "unknown error",
                });
                (StatusCode::INTERNAL_SERVER_ERROR, fallback).into_response()
            })
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(_: std::io::Error) -> Self {
        GatewayError::Internal
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(_: serde_json::Error) -> Self {
        GatewayError::Internal
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Upstream(err.to_string())
    }
}
