use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// API failure rendered as the `{error: {code, message}}` envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn missing_param(name: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "MISSING_PARAM",
            message: format!("missing required parameter `{name}`"),
        }
    }

    pub fn invalid_param(name: &str, detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_PARAM",
            message: format!("invalid parameter `{name}`: {}", detail.into()),
        }
    }

    pub fn invalid_body(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_BODY",
            message: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: format!("{} not found", what.into()),
        }
    }

    pub fn no_model() -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "NO_MODEL",
            message: "no model satisfies the requested category, budget and exclusions"
                .to_string(),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "RATE_LIMITED",
            message: "hourly community feedback allowance exhausted for this instance"
                .to_string(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}
