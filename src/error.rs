use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds the 1500 byte Kasa MTU")]
    EncodingTooLarge { len: usize },
    #[error("malformed Kasa reply: {0}")]
    MalformedReply(#[from] serde_json::Error),
    #[error("malformed Kasa reply: not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("reply did not contain a recognized system payload")]
    UnrecognizedShape,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no control point named '{0}'")]
    UnknownPoint(String),
    #[error("pulse duration must not be negative")]
    InvalidPulse,
    #[error("state must be 'on', 'off', '1', or '0', got '{0}'")]
    InvalidState(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Wraps a domain error together with the HTTP status it should be reported as,
/// mirroring the teacher's ApiError/ApiErrorJson shape.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ApiError {
    status_code: StatusCode,
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl ApiError {
    pub fn new(
        status_code: StatusCode,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            status_code,
            source: Box::new(source),
        }
    }

    pub fn not_found(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(StatusCode::NOT_FOUND, source)
    }

    pub fn bad_request(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(StatusCode::BAD_REQUEST, source)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiErrorJsonBody {
    code: u16,
    status: String,
    reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiErrorJson {
    error: ApiErrorJsonBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = ApiErrorJson {
            error: ApiErrorJsonBody {
                code: self.status_code.as_u16(),
                status: self.status_code.to_string(),
                reason: self.source.to_string(),
            },
        };

        (
            self.status_code,
            serde_json::to_string(&body).expect("serialization of ApiErrorJson cannot fail"),
        )
            .into_response()
    }
}
