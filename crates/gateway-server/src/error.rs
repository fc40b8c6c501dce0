use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use gateway_engine::EngineError;

/// Request failures, rendered as `{"error": "..."}` with a matching status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::EmptyPrompt => Self::BadRequest(e.to_string()),
            EngineError::TurnInProgress(_) => Self::Conflict(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ids::SessionId;

    #[test]
    fn engine_errors_map_to_statuses() {
        let empty: ApiError = EngineError::EmptyPrompt.into();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        assert_eq!(empty.to_string(), "content is required");

        let busy: ApiError = EngineError::TurnInProgress(SessionId::from_raw("s")).into();
        assert_eq!(busy.status(), StatusCode::CONFLICT);
    }
}
