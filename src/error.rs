/// Errors returned by the auth client, session store, controller and relay.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport failure, timeout, or an unreadable response body.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The auth service rejected the username/password pair.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The access or refresh token is expired or invalid.
    #[error("Unauthorized: {operation}")]
    Unauthorized { operation: &'static str },

    /// The payload was rejected before or by the server.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The auth service answered with a status the operation does not expect.
    #[error("{operation} failed with HTTP {status}: {detail}")]
    Api {
        operation: &'static str,
        status: u16,
        detail: String,
    },

    /// The persisted session slot could not be read or written.
    #[error("Session store error: {0}")]
    Store(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The email relay refused the report.
    #[error("Relay rejected report with HTTP {status}: {detail}")]
    Relay { status: u16, detail: String },
}

/// Coarse classification of an [`Error`], for callers that only branch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    InvalidCredentials,
    Unauthorized,
    Validation,
    Api,
    Store,
    Config,
    Relay,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Api { .. } => ErrorKind::Api,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::Relay { .. } => ErrorKind::Relay,
        }
    }

    /// `true` when the failure means the presented token is no longer accepted.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Store(e.to_string())
    }
}
