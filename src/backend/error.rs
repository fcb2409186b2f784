use serde::Serialize;
use std::fmt;

/// Failure reported by one of the external collaborators.
///
/// `code` is a stable machine-readable tag; `message` is what the user sees
/// next to the name of the failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", message, true)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message, false)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message, false)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message, false)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new("STORAGE_ERROR", message, true)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new("DATABASE_ERROR", message, true)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new("INVALID_RESPONSE", message, false)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new("UNSUPPORTED", message, false)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(format!("HTTP_{status}"), message, status >= 500)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "NOT_FOUND"
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl std::error::Error for RemoteError {}

/// Extension trait for turning arbitrary errors into a `RemoteError`
pub trait IntoRemoteError<T> {
    fn into_storage_error(self) -> Result<T, RemoteError>;
    fn into_database_error(self) -> Result<T, RemoteError>;
}

impl<T, E: fmt::Display> IntoRemoteError<T> for Result<T, E> {
    fn into_storage_error(self) -> Result<T, RemoteError> {
        self.map_err(|e| RemoteError::storage(e.to_string()))
    }

    fn into_database_error(self) -> Result<T, RemoteError> {
        self.map_err(|e| RemoteError::database(e.to_string()))
    }
}
