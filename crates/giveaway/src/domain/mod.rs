mod competitions;
mod draws;
mod hooks;
mod payments;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
pub use competitions::*;
pub use draws::*;
pub use hooks::*;
pub use payments::*;
use serde_json::json;
use thiserror::Error;

use crate::infra::{db::DatabaseWriteError, pi::ProcessorError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("problem querying db: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("problem writing db: {0}")]
    DbWriteError(#[from] DatabaseWriteError),
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("competition {0} is sold out: requested {1}, remaining {2}")]
    CapacityExceeded(String, u32, u32),
    #[error("competition {0} is not open for entries")]
    CompetitionNotActive(String),
    #[error("operation not valid for current state: {0}")]
    InvalidState(String),
    #[error("draw for week {0} already resolved")]
    AlreadyResolved(String),
    #[error("caller is not the selected winner for week {0}")]
    NotWinner(String),
    #[error("too much contention on the ledger, retry the request")]
    ConflictRetryExhausted,
    #[error("thread error: {0}")]
    Thread(String),
    #[error("{0}")]
    Upstream(#[from] ProcessorError),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) | Error::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Error::CapacityExceeded(..)
            | Error::CompetitionNotActive(_)
            | Error::InvalidState(_)
            | Error::AlreadyResolved(_) => StatusCode::CONFLICT,
            Error::NotWinner(_) => StatusCode::FORBIDDEN,
            Error::ConflictRetryExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream(ProcessorError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream(ProcessorError::Rejected(_)) => StatusCode::BAD_GATEWAY,
            Error::DbError(_) | Error::DbWriteError(_) | Error::Thread(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
