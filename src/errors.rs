//! Custom error types for the measurement engine.
//!
//! Every failure inside a session maps to one of the kinds below; the
//! session fails fast on the first of them and surfaces the message to
//! the display layer.

use std::error::Error;
use std::fmt;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, DNS failure, timeout).
    pub const NETWORK_ERROR: i32 = 1;
    /// The server answered with an unexpected status or body.
    pub const SERVER_ERROR: i32 = 2;
    /// Configuration error (invalid arguments).
    pub const CONFIG_ERROR: i32 = 3;
    /// The session was aborted before it finished.
    pub const CANCELLED: i32 = 4;
    /// A measurement produced no usable value.
    pub const MEASUREMENT_ERROR: i32 = 5;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection or DNS failure.
    Network,
    /// Non-success HTTP status where success was required.
    HttpStatus,
    /// The per-operation timer elapsed before completion.
    Timeout,
    /// The operation was explicitly aborted.
    Cancelled,
    /// Success status but no response body where one was required.
    MissingBody,
    /// Invalid configuration or arguments.
    Config,
    /// Measurement produced no usable value.
    Measurement,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Network => exit_codes::NETWORK_ERROR,
            ErrorKind::Timeout => exit_codes::NETWORK_ERROR,
            ErrorKind::HttpStatus => exit_codes::SERVER_ERROR,
            ErrorKind::MissingBody => exit_codes::SERVER_ERROR,
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::Cancelled => exit_codes::CANCELLED,
            ErrorKind::Measurement => exit_codes::MEASUREMENT_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error",
            ErrorKind::HttpStatus => "Unexpected HTTP status",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::MissingBody => "Missing response body",
            ErrorKind::Config => "Configuration error",
            ErrorKind::Measurement => "Measurement error",
        }
    }
}

/// The error type for everything the measurement engine does.
#[derive(Debug)]
pub struct MeasureError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl MeasureError {
    /// Create a new MeasureError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Create an HTTP status error.
    pub fn http_status(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HttpStatus, message)
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Create a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Create a missing body error.
    pub fn missing_body(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingBody, message)
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// Create a measurement error.
    pub fn measurement(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Measurement, message)
    }

    /// Classify a transport error from the HTTP client.
    ///
    /// Timeouts keep their own kind so the session can distinguish a
    /// slow link from an unreachable one; everything else that happens
    /// below the status line is a network failure.
    pub fn from_reqwest(context: &str, error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.status().is_some() {
            ErrorKind::HttpStatus
        } else {
            ErrorKind::Network
        };

        Self::new(kind, format!("{}: {}", context, error)).with_source(error)
    }
}

impl fmt::Display for MeasureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)
    }
}

impl Error for MeasureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}
