use std::fmt;

/// Every failure the library reports to its host.
///
/// Transport and vendor failures are translated into this taxonomy at the
/// client boundary; no raw `reqwest` error is ever returned.
#[derive(Debug)]
pub enum Error {
    /// Credentials are missing, rejected or expired beyond refresh.
    Auth(String),
    /// Caller-supplied input was out of range. Never sent to the network.
    Validation(String),
    /// Timeouts, connection failures, HTTP 429 and 5xx.
    Transient(String),
    /// A dispense session is already running for the device.
    Conflict(String),
    /// Unknown device or resource (HTTP 404).
    NotFound(String),
    /// Unexpected vendor response. `payload` is the raw body, kept verbatim.
    Api {
        status: Option<u16>,
        message: String,
        payload: String,
    },
    Config(String),
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(msg) => write!(f, "Authentication error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Transient(msg) => write!(f, "Network error: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Api {
                status: Some(status),
                message,
                ..
            } => write!(f, "API error (HTTP {}): {}", status, message),
            Error::Api { message, .. } => write!(f, "API error: {}", message),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Yaml(err) => write!(f, "YAML parsing error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transient(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Error::Transient(format!("connection failed: {}", err))
        } else {
            Error::Transient(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
