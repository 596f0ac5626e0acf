use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidAssignment,
    NotFound,
    ImportFailed,
    SyncFailure,
    Validation,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("import failed: {0}")]
    Import(String),
    #[error("review store out of sync: {0}")]
    SyncFailure(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid_assignment(message: impl Into<String>) -> Self {
        Self::InvalidAssignment(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn import(message: impl Into<String>) -> Self {
        Self::Import(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidAssignment(_) => ErrorCode::InvalidAssignment,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Import(_) => ErrorCode::ImportFailed,
            CoreError::SyncFailure(_) => ErrorCode::SyncFailure,
            CoreError::Storage(_) => ErrorCode::Internal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
