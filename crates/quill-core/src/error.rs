use thiserror::Error;

/// Core error type for store and dependency failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// External dependency error
    #[error("External dependency error: {0}")]
    ExternalDependencyError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation did not complete in time
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the error means the backing store could not be reached
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CoreError::StateStoreError(_) | CoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
