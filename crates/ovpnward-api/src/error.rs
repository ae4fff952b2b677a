use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use ovpnward_types::ActionResponse;
use thiserror::Error;

use crate::store::{AllocError, LedgerError, RegistryError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn unauthenticated() -> Self {
        Self::Unauthorized("authentication required".into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ActionResponse::failed(self.to_string()))
    }
}

impl From<AllocError> for ApiError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NoRangeAvailable { .. } | AllocError::GroupFull => {
                Self::Conflict(err.to_string())
            }
            AllocError::GroupNotFound => Self::NotFound(err.to_string()),
            AllocError::AlreadyReserved | AllocError::Overlap { .. } | AllocError::OutOfRange { .. } => {
                tracing::error!(error = %err, "allocator error");
                Self::Internal
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(msg) => Self::Validation(msg),
            RegistryError::NameConflict => Self::Conflict(err.to_string()),
            RegistryError::NotFound => Self::NotFound(err.to_string()),
            RegistryError::Forbidden => Self::Forbidden(err.to_string()),
            RegistryError::Alloc(e) => e.into(),
            RegistryError::State(_) => {
                tracing::error!(error = %err, "group registry error");
                Self::Internal
            }
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(msg) => Self::Validation(msg),
            LedgerError::InvalidAuth => Self::Unauthorized(err.to_string()),
            LedgerError::NotFound | LedgerError::GroupNotFound => Self::NotFound(err.to_string()),
            LedgerError::Revoked => Self::Forbidden(err.to_string()),
            LedgerError::NameConflict
            | LedgerError::GroupFull
            | LedgerError::AlreadyRevoked
            | LedgerError::Busy => Self::Conflict(err.to_string()),
            LedgerError::Alloc(e) => e.into(),
            LedgerError::Pki(_)
            | LedgerError::State(_)
            | LedgerError::Io(_)
            | LedgerError::Render(_)
            | LedgerError::Task(_) => {
                tracing::error!(error = %err, "identity ledger error");
                Self::Internal
            }
        }
    }
}
