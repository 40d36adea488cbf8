use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("unauthorized: the backend rejected the API key")]
    Unauthorized,
    #[error("unexpected status {status}: {detail}")]
    UnexpectedStatus { status: u16, detail: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    /// A failure already published as a report, e.g. the poller's current
    /// fetch error.
    #[error("{}", .0.message)]
    Reported(ErrorReport),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
}

/// Failure classes as the dashboard presents them. Only `TransientService`
/// is retried by the poller.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientService,
    Authorization,
    Protocol,
    LogicalFailure,
    Internal,
}

/// Cloneable, serializable view of an `AppError`; this is the "current error"
/// value held by the poller and the view.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceUnavailable(_) => ErrorKind::TransientService,
            Self::Unauthorized => ErrorKind::Authorization,
            Self::UnexpectedStatus { .. }
            | Self::MalformedResponse(_)
            | Self::Reqwest(_)
            | Self::SimdJson(_) => ErrorKind::Protocol,
            Self::Rejected(_) => ErrorKind::LogicalFailure,
            Self::Reported(report) => report.kind,
            Self::InvalidArgument(_) | Self::Sqlx(_) | Self::Migration(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientService
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_service_unavailable_is_transient() {
        assert!(AppError::ServiceUnavailable("overloaded".to_string()).is_transient());
        assert!(!AppError::Unauthorized.is_transient());
        assert!(!AppError::UnexpectedStatus {
            status: 500,
            detail: "boom".to_string()
        }
        .is_transient());
        assert!(!AppError::Rejected("nope".to_string()).is_transient());
    }

    #[test]
    fn reported_error_keeps_its_original_kind() {
        let original = AppError::Unauthorized.report();
        let error = AppError::Reported(original.clone());

        assert_eq!(error.kind(), ErrorKind::Authorization);
        assert!(!error.is_transient());
        assert_eq!(error.report(), original);
    }

    #[test]
    fn report_carries_kind_and_display_message() {
        let report = AppError::Rejected("loan 7 is not closable".to_string()).report();
        assert_eq!(report.kind, ErrorKind::LogicalFailure);
        assert_eq!(report.message, "command rejected: loan 7 is not closable");
    }
}
