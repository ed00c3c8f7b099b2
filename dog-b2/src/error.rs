use thiserror::Error;

/// Result type for B2 operations
pub type B2Result<T> = Result<T, B2Error>;

/// Errors that can occur while talking to the B2 API
///
/// Payloads are plain strings so the error stays `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum B2Error {
    #[error("Invalid authorization: {0}")]
    InvalidAuthorization(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authorization token expired")]
    AuthorizationExpired,

    #[error("Upload endpoint is no longer valid: {0}")]
    EndpointInvalid(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Source cannot be re-read at offset {offset}")]
    NonResumableSource { offset: u64 },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<B2Error> },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Transient API error {status} ({code}): {message}")]
    Transient {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl B2Error {
    /// Create an I/O error from anything displayable
    pub fn io<E: std::fmt::Display>(error: E) -> Self {
        Self::Io(error.to_string())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an error for a request that can never be sent as built
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a connection failure
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an integrity mismatch error
    pub fn integrity<S: Into<String>>(message: S) -> Self {
        Self::IntegrityMismatch(message.into())
    }

    /// Worth retrying the same request after a backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Transient { .. })
    }

    /// The upload URL/token pair must be discarded
    pub fn is_endpoint_invalid(&self) -> bool {
        matches!(self, Self::EndpointInvalid(_))
    }

    /// The account token must be refreshed before retrying
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthorizationExpired)
    }

    /// Unwrap a `RetryExhausted` down to the error that caused it
    pub fn root_cause(&self) -> &B2Error {
        match self {
            Self::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for B2Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for B2Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
