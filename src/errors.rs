use thiserror::Error;

use crate::classifier::ErrorCategory;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required configuration: {field}")]
    ConfigurationMissing { field: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file type: {path}. Only video files are supported.")]
    InvalidFileType { path: String },

    #[error("File too large: {path}. Maximum size is 1GB.")]
    FileTooLarge { path: String },

    #[error("Authentication failed ({category}): {reason}")]
    AuthenticationFailed {
        category: ErrorCategory,
        reason: String,
    },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Another run already holds the lock for account {account} (PID {pid})")]
    InstanceLocked { account: String, pid: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn configuration_missing(field: &str) -> Self {
        Self::ConfigurationMissing {
            field: field.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_file_type(path: &str) -> Self {
        Self::InvalidFileType {
            path: path.to_string(),
        }
    }

    pub fn file_too_large(path: &str) -> Self {
        Self::FileTooLarge {
            path: path.to_string(),
        }
    }

    pub fn authentication_failed(category: ErrorCategory, reason: &str) -> Self {
        Self::AuthenticationFailed {
            category,
            reason: reason.to_string(),
        }
    }

    /// Category the failure maps to when it happens inside a publish run.
    ///
    /// Authentication failures keep the category of the last remote signal
    /// the chain saw; everything else local is fatal.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::AuthenticationFailed { category, .. } => *category,
            AppError::Network(e) if e.is_timeout() || e.is_connect() => {
                ErrorCategory::TransientNetwork
            }
            _ => ErrorCategory::Fatal,
        }
    }

    /// Errors raised before the first attempt that must stop the process.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AppError::ConfigurationMissing { .. }
                | AppError::Config(_)
                | AppError::Validation { .. }
                | AppError::InstanceLocked { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_keeps_its_category() {
        let err = AppError::authentication_failed(ErrorCategory::ChallengeRequired, "checkpoint");
        assert_eq!(err.category(), ErrorCategory::ChallengeRequired);
        assert!(err.to_string().contains("checkpoint"));
    }

    #[test]
    fn setup_errors_are_flagged() {
        assert!(AppError::configuration_missing("account_username").is_setup_error());
        assert!(AppError::InstanceLocked {
            account: "a".into(),
            pid: 1
        }
        .is_setup_error());
        assert!(!AppError::file_not_found("clip.mp4").is_setup_error());
        assert_eq!(AppError::Internal("x".into()).category(), ErrorCategory::Fatal);
    }
}
