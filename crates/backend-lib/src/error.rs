// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use crate::validation::ValidationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chat_relay_common::ServerToClient;
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connection has no identity")]
    Unidentified,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ChannelNotFound(_) | AppError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unidentified => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Storage(_) => "PERSIST_001",
            AppError::ChannelNotFound(_) => "CHAN_001",
            AppError::MessageNotFound(_) => "MSG_001",
            AppError::Validation(_) => "VAL_001",
            AppError::Unidentified => "UNIDENTIFIED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Config(_) => "CFG_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Io(_) | AppError::Json(_) | AppError::Storage(_) => {
                "Message could not be stored, please retry".to_string()
            },
            AppError::ChannelNotFound(_) => "Channel not found".to_string(),
            AppError::MessageNotFound(_) => "Message not found".to_string(),
            AppError::Validation(e) => e.to_string(),
            AppError::Unidentified => "Connection is not identified".to_string(),
            AppError::Forbidden(_) => "Not allowed".to_string(),
            AppError::Config(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Render the error as the event sent back to a message sender whose
    /// submission was rejected
    pub fn to_send_failed(&self) -> ServerToClient {
        ServerToClient::SendFailed {
            code: self.error_code().to_string(),
            message: self.client_message(),
        }
    }

    /// Render the error as a generic request error event
    pub fn to_server_message(&self) -> ServerToClient {
        ServerToClient::Error {
            code: self.error_code().to_string(),
            message: self.client_message(),
        }
    }

    // Use detailed messages in development, sanitized in production
    fn client_message(&self) -> String {
        if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Internal(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}
