use thiserror::Error;

/// Common error types used across the workspace.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure came from transport or infrastructure rather than
    /// from the content of the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::Redis(_) | AppError::Http(_) | AppError::Internal(_)
        )
    }

    /// Whether repeating the same call can succeed. Client errors from a
    /// remote service (4xx other than 429) never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Http(e) => match e.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => true,
            },
            AppError::Redis(_) | AppError::Internal(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(AppError::Internal("boom".into()).is_infrastructure());
        assert!(!AppError::Validation("bad".into()).is_infrastructure());
        assert!(!AppError::Auth("denied".into()).is_infrastructure());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Internal("boom".into()).is_retryable());
        assert!(!AppError::Validation("bad".into()).is_retryable());
        assert!(!AppError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AppError::Config("OWNER_SERVICE_URL missing".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: OWNER_SERVICE_URL missing"
        );
    }
}
