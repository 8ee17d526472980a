use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// No image was attached to the request
    #[error("No image provided")]
    MissingInput,

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The user has no credit left for another optimisation
    #[error("Insufficient credits")]
    InsufficientCredits,

    /// Upload exceeds the configured ceiling
    #[error("Upload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Concurrency limiter rejected the request
    #[error("{message}")]
    TooManyRequests { message: String },

    /// The image could not be decoded or encoded
    #[error("Transcode failed: {reason}")]
    TranscodeFailed { reason: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingInput | Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::TranscodeFailed { .. } | Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingInput => "No image file provided.".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InsufficientCredits => "Insufficient credits".to_string(),
            Error::PayloadTooLarge { limit } => format!("Image is too large (limit is {})", human_size(*limit)),
            Error::TooManyRequests { message } => message.clone(),
            Error::TranscodeFailed { .. } => "Failed to process image. Make sure it is a valid image file.".to_string(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::TranscodeFailed { .. } | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Unauthenticated { .. } | Error::InsufficientCredits => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::TooManyRequests { .. } => {
                tracing::warn!("Capacity error: {}", self);
            }
            Error::MissingInput | Error::BadRequest { .. } | Error::PayloadTooLarge { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = ErrorBody {
            error: self.user_message(),
        };
        (status, Json(body)).into_response()
    }
}

fn human_size(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MB", bytes / MIB)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{} KB", bytes / KIB)
    } else {
        format!("{bytes} bytes")
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: Error) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_codes_and_json_body() {
        let cases = [
            (Error::MissingInput, StatusCode::BAD_REQUEST, "No image file provided."),
            (Error::Unauthenticated { message: None }, StatusCode::UNAUTHORIZED, "Authentication required"),
            (Error::InsufficientCredits, StatusCode::PAYMENT_REQUIRED, "Insufficient credits"),
            (
                Error::PayloadTooLarge { limit: 10 * 1024 * 1024 },
                StatusCode::PAYLOAD_TOO_LARGE,
                "Image is too large (limit is 10 MB)",
            ),
        ];

        for (err, status, message) in cases {
            let (got_status, body) = body_of(err).await;
            assert_eq!(got_status, status);
            assert_eq!(body["error"], message);
        }
    }

    #[test]
    fn test_small_size_limits_are_not_rounded_to_zero() {
        let message = |limit| Error::PayloadTooLarge { limit }.user_message();
        assert_eq!(message(512 * 1024), "Image is too large (limit is 512 KB)");
        assert_eq!(message(800), "Image is too large (limit is 800 bytes)");
        assert_eq!(message(3 * 1024 * 1024 / 2), "Image is too large (limit is 1.5 MB)");
        assert_eq!(message(25 * 1024 * 1024), "Image is too large (limit is 25 MB)");
    }

    #[tokio::test]
    async fn test_internal_details_are_not_leaked() {
        let (status, body) = body_of(Error::TranscodeFailed {
            reason: "failed to decode image: Format error decoding Png".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to process image. Make sure it is a valid image file.");

        let (status, body) = body_of(Error::Other(anyhow::anyhow!("connection refused on 10.0.0.3"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }
}
