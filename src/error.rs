//! Error taxonomy (spec.md §7) and its mapping onto `tonic::Status`.
//!
//! Every fallible path in the crate returns [`ControllerError`]; handlers
//! convert it to a `Status` only at the RPC boundary (`From<ControllerError>
//! for tonic::Status`), following the same "one error type, convert at the
//! edge" shape as the teacher's `RpcError`/`RpcErrorCode`.

use thiserror::Error;

/// Crate-wide error type, one variant per taxonomy bucket in spec.md §7.
#[derive(Debug, Error, Clone)]
pub enum ControllerError {
    /// Malformed page token or resource name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store reports the resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition was violated (scale cancelled, deployment failed).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A deadline elapsed before the operation completed.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// An unexpected internal failure (store error, event-listener failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// The client cancelled the RPC.
    #[error("cancelled")]
    Cancelled,
}

impl ControllerError {
    /// Build an [`ControllerError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Build an [`ControllerError::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build an [`ControllerError::FailedPrecondition`].
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Build an [`ControllerError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// `true` for errors a background forwarder may legitimately surface
    /// through a subscription's error cell (spec.md §7 propagation policy).
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<sqlx::Error> for ControllerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ControllerError> for tonic::Status {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            ControllerError::NotFound(msg) => tonic::Status::not_found(msg),
            ControllerError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ControllerError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            ControllerError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                tonic::Status::internal(msg)
            }
            ControllerError::Cancelled => tonic::Status::cancelled("client cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_expected_status_codes() {
        let cases: Vec<(ControllerError, tonic::Code)> = vec![
            (
                ControllerError::invalid_argument("bad"),
                tonic::Code::InvalidArgument,
            ),
            (ControllerError::not_found("nope"), tonic::Code::NotFound),
            (
                ControllerError::failed_precondition("no"),
                tonic::Code::FailedPrecondition,
            ),
            (
                ControllerError::DeadlineExceeded("30s".into()),
                tonic::Code::DeadlineExceeded,
            ),
            (ControllerError::internal("boom"), tonic::Code::Internal),
            (ControllerError::Cancelled, tonic::Code::Cancelled),
        ];
        for (err, code) in cases {
            let status: tonic::Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: ControllerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ControllerError::NotFound(_)));
    }
}
