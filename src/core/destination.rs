use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::message::{Scheme, SipUri};

// Constants for health status to replace magic numbers
const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to destination construction
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DestinationError {
    /// Preference value outside `[0.0, 1.0]`
    #[error("Preference value must be within [0.0, 1.0], got: {0}")]
    InvalidPreference(f32),

    /// URI missing or empty
    #[error("Destination URI must not be empty")]
    MissingUri,

    /// Address missing or empty
    #[error("Destination address must not be empty for {0}")]
    MissingAddress(String),

    /// Transport name not recognised
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),
}

/// Result type for destination operations
pub type DestinationResult<T> = Result<T, DestinationError>;

/// Transport protocol used to reach a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Transport {
    /// Default port when neither the URI nor an SRV record names one
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Tls | Transport::Wss => 5061,
            Transport::Udp | Transport::Tcp | Transport::Ws => 5060,
        }
    }

    /// SRV service label used when searching for this transport
    pub fn srv_prefix(self) -> &'static str {
        match self {
            Transport::Udp => "_sip._udp",
            Transport::Tcp => "_sip._tcp",
            Transport::Tls => "_sips._tcp",
            Transport::Ws => "_sip._ws",
            Transport::Wss => "_sips._ws",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Transport::Tls | Transport::Wss)
    }

    /// Transport implied by a URI: explicit `transport=` wins, `sips:` means TLS.
    pub fn for_uri(uri: &SipUri) -> DestinationResult<Self> {
        match uri.transport_param() {
            Some(name) => name.parse(),
            None if uri.scheme() == Scheme::Sips => Ok(Transport::Tls),
            None => Ok(Transport::Udp),
        }
    }
}

impl FromStr for Transport {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "ws" => Ok(Transport::Ws),
            "wss" => Ok(Transport::Wss),
            other => Err(DestinationError::UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        };
        f.write_str(name)
    }
}

/// How a destination was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    /// Produced from an SRV record
    Srv,
    /// Produced from an address record or a literal IP
    A,
    /// Configured statically on a trunk
    ServerGroup,
    /// Taken verbatim from a request (established dialog route)
    Default,
}

/// Identity of a destination for exclusion and health tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey(String);

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A candidate network target. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Destination {
    kind: DestinationType,
    address: String,
    network: Option<String>,
    transport: Transport,
    preference: f32,
    uri: String,
    routing_hint: Option<String>,
}

impl Destination {
    /// Preference used when none is configured
    pub const DEFAULT_PREFERENCE: f32 = 1.0;

    /// Creates a destination after validating its invariants
    ///
    /// # Arguments
    /// * `kind` - how the destination was obtained
    /// * `address` - `host:port` the transport should connect to
    /// * `transport` - transport protocol
    /// * `uri` - URI the request is sent towards, always present
    /// * `preference` - weight in `[0.0, 1.0]`, see [`Self::DEFAULT_PREFERENCE`]
    pub fn new(
        kind: DestinationType,
        address: impl Into<String>,
        transport: Transport,
        uri: impl Into<String>,
        preference: f32,
    ) -> DestinationResult<Self> {
        let uri = uri.into();
        let address = address.into();

        if uri.trim().is_empty() {
            return Err(DestinationError::MissingUri);
        }
        if address.trim().is_empty() {
            return Err(DestinationError::MissingAddress(uri));
        }
        if !(0.0..=1.0).contains(&preference) || preference.is_nan() {
            return Err(DestinationError::InvalidPreference(preference));
        }

        Ok(Self {
            kind,
            address,
            network: None,
            transport,
            preference,
            uri,
            routing_hint: None,
        })
    }

    /// Derive address and transport from a URI, filling in the transport's
    /// default port when the URI carries none.
    pub fn from_uri(kind: DestinationType, uri: &SipUri, preference: f32) -> DestinationResult<Self> {
        let transport = Transport::for_uri(uri)?;
        let port = uri.port().unwrap_or_else(|| transport.default_port());
        let host = if uri.host().contains(':') {
            format!("[{}]", uri.host())
        } else {
            uri.host().to_string()
        };
        Self::new(kind, format!("{host}:{port}"), transport, uri.to_string(), preference)
    }

    /// Same destination bound to a logical network interface
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Same destination carrying an extra routing/correlation token
    pub fn with_routing_hint(mut self, hint: impl Into<String>) -> Self {
        self.routing_hint = Some(hint.into());
        self
    }

    pub fn kind(&self) -> DestinationType {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn preference(&self) -> f32 {
        self.preference
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn routing_hint(&self) -> Option<&str> {
        self.routing_hint.as_deref()
    }

    /// Identity used by the load balancer's excluded set and health table
    pub fn key(&self) -> DestinationKey {
        DestinationKey(format!("{}|{}|{}", self.transport, self.address, self.uri))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}/{}", self.uri, self.transport, self.address)
    }
}

/// Liveness as last reported by the keep-alive prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Tracks the health status of a destination
#[derive(Debug)]
pub struct DestinationHealth {
    /// Current health status (uses atomic for thread safety)
    status: AtomicU8, // Uses HEALTH_STATUS_* constants
    /// Counter for consecutive successful probes
    pub consecutive_successes: AtomicU32,
    /// Counter for consecutive failed probes
    pub consecutive_failures: AtomicU32,
}

impl Default for DestinationHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationHealth {
    /// New record, initialized as healthy
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Set the status without touching the probe counters
    pub fn set_status(&self, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => HEALTH_STATUS_HEALTHY,
            HealthStatus::Unhealthy => HEALTH_STATUS_UNHEALTHY,
        };
        self.status.store(value, Ordering::Release);
    }

    /// Count a successful probe, resetting the failure streak. Returns the
    /// current success streak.
    pub fn record_success(&self) -> u32 {
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count a failed probe, resetting the success streak. Returns the
    /// current failure streak.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_successes.store(0, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}
