use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::callback::CallbackError;
use crate::database::DatabaseError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("JSON input not valid: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CallbackError> for ServerError {
    fn from(e: CallbackError) -> Self {
        match e {
            CallbackError::Unauthorized => ServerError::Unauthorized,
            CallbackError::BadRequest(message) => ServerError::Validation(message),
            CallbackError::Internal(message) => ServerError::Internal(message),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ServerError::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ServerError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
        };

        let body = Json(json!({
            "error": true,
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
