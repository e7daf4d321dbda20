use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::InstanceError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

const TRUNCATED: &str = "…(truncated)";

/// Cuts `s` to at most `max_bytes`, on a char boundary, marking the cut.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let budget = max_bytes.saturating_sub(TRUNCATED.len());
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{TRUNCATED}", &s[..cut])
}

pub fn payload(code: &str, message: impl Into<String>, hint: Option<String>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    }
}

fn status_for(err: &InstanceError) -> StatusCode {
    match err {
        InstanceError::NotFound(_) => StatusCode::NOT_FOUND,
        InstanceError::AlreadyRunning(_)
        | InstanceError::PortInUse(_)
        | InstanceError::IllegalTransition { .. } => StatusCode::CONFLICT,
        InstanceError::Configuration(_)
        | InstanceError::BlueprintNotFound { .. }
        | InstanceError::PortOutOfRange { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        InstanceError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP rendering of an [`InstanceError`].
#[derive(Debug)]
pub struct ApiError(pub InstanceError);

impl From<InstanceError> for ApiError {
    fn from(value: InstanceError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = payload(self.0.code(), self.0.to_string(), self.0.hint());
        (status, Json(body)).into_response()
    }
}
