use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a record lookup backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LookupError {
    /// The name does not exist or has no records of the requested type
    #[error("No records for {0}")]
    NotFound(String),

    /// The backend failed (network, server failure, ...)
    #[error("Lookup of {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

/// Result type alias for lookups
pub type LookupResult<T> = Result<T, LookupError>;

/// One SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// RecordLookup defines the port for name-record queries used by the
/// destination resolver. Implementations should keep blocking work off the
/// async worker threads.
#[async_trait]
pub trait RecordLookup: Send + Sync + 'static {
    /// Query SRV records for a fully prefixed owner name
    /// (e.g. `_sip._udp.example.com`). An empty list means "no SRV records".
    async fn lookup_srv(&self, name: &str) -> LookupResult<Vec<SrvRecord>>;

    /// Resolve a host name to socket addresses on the given port
    async fn lookup_addresses(&self, host: &str, port: u16) -> LookupResult<Vec<SocketAddr>>;
}
