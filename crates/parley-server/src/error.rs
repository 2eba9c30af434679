use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_store::StoreError;

/// Failure taxonomy for every operation the server exposes.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No or invalid identity on an operation requiring one.
    #[error("Authentication required")]
    Unauthorized,

    /// Group-scoped operation by a non-member. Reported to the caller
    /// only; never reveals anything about the group to outsiders.
    #[error("You are not a member of this group")]
    NotAMember,

    /// Conversation-scoped operation by a non-participant.
    #[error("You are not a participant of this conversation")]
    NotParticipant,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("File too large: {size} bytes (max {max})")]
    MediaTooLarge { size: usize, max: usize },

    /// Media file storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The durable store failed mid-operation. Surfaced generically;
    /// detail goes to the log only.
    #[error("Persistence failure: {0}")]
    Persistence(StoreError),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("record"),
            other => ServerError::Persistence(other),
        }
    }
}

impl ServerError {
    /// Reason string for the real-time `error` event. Persistence and
    /// storage detail never reaches the client.
    pub fn client_reason(&self) -> String {
        match self {
            Self::Persistence(_) | Self::Storage(_) => "Operation failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::NotAMember | ServerError::NotParticipant => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::MediaTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::Storage(detail) => {
                tracing::error!(detail = %detail, "media storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ServerError::Persistence(detail) => {
                tracing::error!(detail = %detail, "persistence failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_detail_never_reaches_clients() {
        let err = ServerError::Persistence(StoreError::Migration("secret path".to_string()));
        assert_eq!(err.client_reason(), "Operation failed");

        let err = ServerError::NotAMember;
        assert_eq!(err.client_reason(), "You are not a member of this group");
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err = ServerError::from(StoreError::NotFound);
        assert!(matches!(err, ServerError::NotFound(_)));
    }
}
