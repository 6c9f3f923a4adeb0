//! Error type definitions for the 5GMS Application Function.
//!
//! All peer-facing failures are expressed as [`AppError`] and rendered as
//! RFC 7807 `application/problem+json` bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// A single entry of `invalidParams` on a validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidParam {
    pub param: String,
    pub reason: Option<String>,
}

impl InvalidParam {
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            reason: None,
        }
    }

    pub fn with_reason(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            reason: Some(reason.into()),
        }
    }
}

/// Top-level application error type.
///
/// Each variant carries exactly the data needed to render the problem-detail
/// body; the HTTP status code is fixed per variant.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {detail}")]
    Validation {
        detail: String,
        invalid_params: Vec<InvalidParam>,
    },

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("upstream error: {service} - {detail}")]
    Upstream { service: String, detail: String },

    #[error("timeout contacting {0}")]
    Timeout(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
            invalid_params: Vec::new(),
        }
    }

    pub fn validation_with_params(detail: impl Into<String>, params: Vec<InvalidParam>) -> Self {
        Self::Validation {
            detail: detail.into(),
            invalid_params: params,
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn upstream(service: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Upstream {
            service: service.into(),
            detail: detail.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "Bad Request",
            AppError::Auth(_) => "Unauthorized",
            AppError::NotFound { .. } => "Not Found",
            AppError::Conflict(_) => "Conflict",
            AppError::PreconditionFailed => "Precondition Failed",
            AppError::UnsupportedMediaType(_) => "Unsupported Media Type",
            AppError::Upstream { .. } => "Bad Gateway",
            AppError::Timeout(_) => "Gateway Timeout",
            AppError::Internal(_) => "Internal Server Error",
        }
    }

    /// Render the RFC 7807 body for this error given the resource context
    /// that the router (C2) matched the failing request against.
    pub fn into_problem(self, service_name: &str, api_version: &str, instance: &str) -> Response {
        if let AppError::Internal(ref cause) = self {
            tracing::error!(error = %cause, "internal error handling {instance}");
        }
        let status = self.status();
        let title = self.title();
        let invalid_params = match &self {
            AppError::Validation { invalid_params, .. } => {
                (!invalid_params.is_empty()).then(|| invalid_params.clone())
            }
            _ => None,
        };
        let body = ProblemDetail {
            r#type: format!("/{service_name}/{api_version}"),
            title: title.to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            instance: instance.to_string(),
            invalid_params,
        };
        (status, Json(body)).into_response()
    }
}

/// Fallback rendering used when no router context is available (e.g. a
/// handler that panics before matching a resource).
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_problem("5gms", "v1", "")
    }
}

#[derive(Debug, Serialize)]
struct ProblemDetail {
    r#type: String,
    title: String,
    status: u16,
    detail: String,
    instance: String,
    #[serde(rename = "invalidParams", skip_serializing_if = "Option::is_none")]
    invalid_params: Option<Vec<InvalidParam>>,
}

pub type AppResult<T> = Result<T, AppError>;
