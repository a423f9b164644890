//! Error taxonomy of the proxy core.
//!
//! Every failure that can reach the transaction controller is a [`ProxyError`]
//! tagged with an [`ErrorKind`]. The controller never inspects messages or
//! types beyond the kind and the optional received status: those are enough to
//! pick the status code that goes through the error-mapping policy.
use std::fmt;

use thiserror::Error;

/// Classification of proxy failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Name lookup failed or timed out after the resolver's own retries
    Resolution,
    /// Every candidate destination was tried and failed
    DestinationUnreachable,
    /// Operation attempted on a transaction in a state that forbids it
    InvalidState,
    /// Unexpected fault in pipeline code
    Internal,
    /// No trunk/egress policy matched the request
    NoRoute,
}

impl ErrorKind {
    /// Status code used when no received status is attached
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::Resolution | ErrorKind::DestinationUnreachable => 503,
            ErrorKind::InvalidState | ErrorKind::Internal => 500,
            ErrorKind::NoRoute => 404,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Resolution => "resolution error",
            ErrorKind::DestinationUnreachable => "destination unreachable",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Internal => "internal proxy error",
            ErrorKind::NoRoute => "no route",
        };
        f.write_str(name)
    }
}

/// Tagged proxy failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    kind: ErrorKind,
    message: String,
    /// Last status received from a destination, when the failure came from one
    status: Option<u16>,
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolution, message)
    }

    /// All candidates exhausted; `last_status` is the final error response
    /// received, if any destination answered at all.
    pub fn unreachable(attempts: usize, last_status: Option<u16>) -> Self {
        Self {
            kind: ErrorKind::DestinationUnreachable,
            message: format!("all {attempts} candidate destination(s) failed"),
            status: last_status,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn no_route(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoRoute, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn received_status(&self) -> Option<u16> {
        self.status
    }

    /// Status code fed into the error-mapping policy
    pub fn status_code(&self) -> u16 {
        match self.kind {
            ErrorKind::DestinationUnreachable => {
                self.status.unwrap_or_else(|| self.kind.default_status())
            }
            kind => kind.default_status(),
        }
    }
}
