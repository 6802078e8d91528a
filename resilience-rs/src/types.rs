//! # Pipeline Error Types
//!
//! The error type shared by every component of the resilience pipeline.
//! Operations handed to the retry and fallback layers report failures with
//! this type as well, so a failure can carry structured context all the way
//! to the report that describes it.

use std::error::Error as StdError;
use std::fmt;

use serde::Serialize;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorizes different kinds of errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Startup or wiring error
    Initialization,
    /// Invalid or unreadable configuration
    Configuration,
    /// Local persistent storage error
    Storage,
    /// Error talking to a remote endpoint
    Communication,
    /// Timeout error
    Timeout,
    /// Remote endpoint unreachable or refusing service
    Unavailable,
    /// Missing or rejected credentials
    Authentication,
    /// Encoding or decoding failure
    Serialization,
    /// Internal invariant violated
    Internal,
    /// Failure of an application operation run through the pipeline
    Operation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Initialization => write!(f, "Initialization Error"),
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::Communication => write!(f, "Communication Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Unavailable => write!(f, "Unavailable Error"),
            ErrorKind::Authentication => write!(f, "Authentication Error"),
            ErrorKind::Serialization => write!(f, "Serialization Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
            ErrorKind::Operation => write!(f, "Operation Error"),
        }
    }
}

/// Core error type for the resilience pipeline
///
/// `Clone` drops the opaque `cause`; everything else is preserved.
#[derive(Debug)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// Additional context as key-value pairs
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Flag indicating if this is a transient error that might succeed on retry
    pub transient: bool,
    /// Underlying cause
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            message: self.message.clone(),
            context: self.context.clone(),
            transient: self.transient,
            cause: None,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            context: serde_json::Map::new(),
            transient: false,
            cause: None,
        }
    }

    /// Shorthand for a failed application operation
    pub fn operation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Operation, message)
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Returns true if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Storage, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string()).cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Unavailable
        } else {
            ErrorKind::Communication
        };

        let transient = err.is_timeout()
            || err.is_connect()
            || err.status().map_or(false, |s| s.is_server_error());

        let mut error = Self::new(kind, format!("HTTP request error: {}", err)).cause(err);
        if transient {
            error = error.transient();
        }
        error
    }
}
