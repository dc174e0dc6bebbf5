use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rolesync_engine::{EngineError, LifecycleError};
use rolesync_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Chat platform error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ServerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Lifecycle(lifecycle) => lifecycle.into(),
            EngineError::Store(store) => store.into(),
            EngineError::Sync(sync) => ServerError::Upstream(sync.to_string()),
            EngineError::ChatNotFound(_) => ServerError::NotFound(e.to_string()),
            EngineError::Duplicate(_) => ServerError::Conflict(e.to_string()),
            EngineError::PassFailed(message) => ServerError::Internal(message),
        }
    }
}

impl From<LifecycleError> for ServerError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::PersonNotFound(_)
            | LifecycleError::RequestNotFound(_)
            | LifecycleError::RoleNotFound(_) => ServerError::NotFound(e.to_string()),
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::RequestDecided(_)
            | LifecycleError::AlreadyRegistered { .. }
            | LifecycleError::TerminationRequested(_) => ServerError::Conflict(e.to_string()),
            LifecycleError::RoleRequired => ServerError::BadRequest(e.to_string()),
            LifecycleError::Store(store) => store.into(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
