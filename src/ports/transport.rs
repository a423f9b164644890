use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    destination::{Destination, Transport as TransportKind},
    message::{Request, Response},
};

/// Custom error type for transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Error when the connection to a destination fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// No final response arrived in time
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The signaling stack cannot send on this transport
    #[error("Unsupported transport: {0}")]
    Unsupported(TransportKind),

    /// The stack rejected the request before sending it
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport defines the port (interface) to the external signaling stack's
/// client side: it sends requests towards a destination and reports the final
/// response.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request to a destination
    ///
    /// # Arguments
    /// * `request` - The (already normalized) request to send
    /// * `destination` - Where to send it
    ///
    /// # Returns
    /// A future that resolves to the destination's final response or an error
    async fn send(&self, request: Request, destination: &Destination) -> TransportResult<Response>;

    /// Perform a keep-alive probe (e.g. an OPTIONS ping)
    ///
    /// # Returns
    /// A future that resolves to true if the destination answered, false otherwise
    async fn probe(&self, destination: &Destination, timeout: Duration) -> TransportResult<bool>;
}
