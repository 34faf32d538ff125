use http::StatusCode;
use validator::ValidationErrors;

use crate::pool::PoolError;
use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Invalid(String),

    #[error("validation error in request body")]
    InvalidEntity(#[from] ValidationErrors),

    #[error("function not found")]
    NotFound,

    #[error("function '{0}' already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("function invocation timed out after {0} seconds")]
    Timeout(i32),

    #[error("{error}")]
    HandlerFailed {
        error: String,
        stack: Option<String>,
        logs: Option<String>,
    },

    #[error("registry backend unavailable")]
    BackendUnavailable(#[source] StoreError),

    #[error("internal server error")]
    InternalServerError,
}

impl Error {
    /// Stable kind discriminant carried in every error response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Invalid(_) | Error::InvalidEntity(_) => "Invalid",
            Error::NotFound => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Unavailable(_) => "Unavailable",
            Error::Timeout(_) => "Timeout",
            Error::HandlerFailed { .. } => "HandlerFailed",
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::InternalServerError => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            Invalid(_) | InvalidEntity(_) => StatusCode::BAD_REQUEST,
            NotFound => StatusCode::NOT_FOUND,
            AlreadyExists(_) => StatusCode::CONFLICT,
            Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            HandlerFailed { .. } => StatusCode::BAD_GATEWAY,
            BackendUnavailable(_) | InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Error::NotFound,
            StoreError::AlreadyExists(name) => Error::AlreadyExists(name),
            StoreError::Invalid(msg) => Error::Invalid(msg),
            other => Error::BackendUnavailable(other),
        }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::UnsupportedRuntime(runtime) => {
                Error::Unavailable(format!("no VM pool for runtime '{runtime}'"))
            }
            PoolError::Vmm(e) => Error::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        let cases = [
            (Error::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound, StatusCode::NOT_FOUND),
            (Error::AlreadyExists("f".into()), StatusCode::CONFLICT),
            (
                Error::Unavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Timeout(30), StatusCode::REQUEST_TIMEOUT),
            (
                Error::HandlerFailed {
                    error: "boom".into(),
                    stack: None,
                    logs: None,
                },
                StatusCode::BAD_GATEWAY,
            ),
            (Error::InternalServerError, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "kind {}", error.kind());
        }
    }
}
