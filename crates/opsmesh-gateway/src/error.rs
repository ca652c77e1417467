use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use opsmesh_core::OpsMeshError;
use tracing::warn;

/// Failure of an API call, rendered as `{"error": ..., "kind": ...}`.
#[derive(Debug)]
pub enum ApiError {
    /// The request itself could not be understood.
    BadRequest(String),
    /// The coordination layer refused the operation.
    Domain(OpsMeshError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Domain(e) => match e {
                OpsMeshError::UnknownAgent(_)
                | OpsMeshError::RecipientNotFound(_)
                | OpsMeshError::UnknownFlowDefinition(_)
                | OpsMeshError::UnknownFlowInstance(_) => StatusCode::NOT_FOUND,
                OpsMeshError::InvalidRecord(_)
                | OpsMeshError::CyclicFlowDefinition(_)
                | OpsMeshError::UnknownStepReference { .. }
                | OpsMeshError::InvalidFlowDefinition(_)
                | OpsMeshError::DuplicateStep(_) => StatusCode::UNPROCESSABLE_ENTITY,
                OpsMeshError::RecipientUnhealthy(_) | OpsMeshError::NoCapableAgent(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                OpsMeshError::Transport(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Domain(e) => e.kind(),
        }
    }
}

impl From<OpsMeshError> for ApiError {
    fn from(e: OpsMeshError) -> Self {
        ApiError::Domain(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "{msg}"),
            ApiError::Domain(e) => write!(f, "{e}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}
