use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    TaskFailed(String),
    AnyhowError(anyhow::Error),
}

impl AgentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AgentError::AnyhowError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_message(&self) -> String {
        match self {
            AgentError::TaskFailed(e) => e.clone(),
            AgentError::AnyhowError(e) => format!("{:#}", e),
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_message())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status_code(),
            Json(json!({"error": self.error_message()})),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(error: anyhow::Error) -> Self {
        AgentError::AnyhowError(error)
    }
}
