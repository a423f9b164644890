//! Configuration data structures for trunkline.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Runtime objects (egress policies, error mapping registry, resolver) are built from
//! them once at load time and are read-only afterwards.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::core::destination::Transport;

fn default_transaction_timeout() -> String {
    "32s".to_string()
}

fn default_ingress_buffer() -> usize {
    1024
}

/// Transaction controller settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Overall budget for one proxied request, parsed by humantime (e.g. "32s")
    #[serde(default = "default_transaction_timeout")]
    pub timeout: String,
    /// Capacity of the bounded ingress channel
    #[serde(default = "default_ingress_buffer")]
    pub ingress_buffer: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout: default_transaction_timeout(),
            ingress_buffer: default_ingress_buffer(),
        }
    }
}

impl TransactionConfig {
    /// Parsed timeout, `None` when the string is not a valid humantime duration
    pub fn timeout_duration(&self) -> Option<Duration> {
        humantime::parse_duration(&self.timeout).ok()
    }
}

/// A statically configured SRV record
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StaticSrvRecord {
    pub priority: u16,
    #[serde(default)]
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// Static lookup table consulted before the system resolver
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StaticRecords {
    /// SRV owner name (e.g. `_sip._udp.example.com`) → records
    pub srv: HashMap<String, Vec<StaticSrvRecord>>,
    /// Host name → IP addresses
    pub hosts: HashMap<String, Vec<String>>,
}

/// Destination resolver settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    /// Per-lookup timeout in milliseconds
    pub timeout_ms: u64,
    /// Lookup attempts before giving up
    pub attempts: u32,
    /// How long resolved destination lists are cached
    pub cache_ttl_secs: u64,
    /// Transports this proxy can send on
    pub supported_transports: Vec<Transport>,
    pub static_records: StaticRecords,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            attempts: 2,
            cache_ttl_secs: 60,
            supported_transports: vec![Transport::Udp, Transport::Tcp, Transport::Tls],
            static_records: StaticRecords::default(),
        }
    }
}

/// Keep-alive probing of trunk destinations
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    /// Destinations absent from every candidate list for this long stop being
    /// probed (0 keeps them forever)
    pub stale_after_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 2,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            stale_after_secs: 3_600,
        }
    }
}

fn default_maintenance_status() -> u16 {
    503
}

fn default_maintenance_reason() -> String {
    "Service Unavailable".to_string()
}

/// Maintenance mode: new requests are rejected without being routed
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_maintenance_status")]
    pub status_code: u16,
    #[serde(default = "default_maintenance_reason")]
    pub reason: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            status_code: default_maintenance_status(),
            reason: default_maintenance_reason(),
        }
    }
}

/// Header mutations applied at one normalization point
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HeaderActions {
    /// Headers set (replacing existing values)
    #[serde(default)]
    pub add: HashMap<String, String>,
    /// Header names removed
    #[serde(default)]
    pub remove: Vec<String>,
}

impl HeaderActions {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Per-trunk normalization settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Applied to the outbound request before a destination is chosen
    pub request_headers: Option<HeaderActions>,
    /// Applied once the destination is chosen
    pub selected_headers: Option<HeaderActions>,
    /// Applied to the final response before it goes upstream
    pub response_headers: Option<HeaderActions>,
    /// Push a `Route` entry pointing at the chosen destination
    pub route_to_destination: bool,
}

fn default_preference() -> f32 {
    1.0
}

/// One statically configured destination
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DestinationConfig {
    pub uri: String,
    #[serde(default = "default_preference")]
    pub preference: f32,
    #[serde(default)]
    pub network: Option<String>,
}

/// Where a trunk's candidate destinations come from
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TargetConfig {
    /// Fixed server group
    Static { destinations: Vec<DestinationConfig> },
    /// Name looked up through the destination resolver
    Resolve {
        name: String,
        #[serde(default)]
        transport: Option<Transport>,
        #[serde(default)]
        port: Option<u16>,
    },
}

/// Egress policy of one trunk
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrunkConfig {
    pub target: TargetConfig,
    /// Response codes that mark a destination unusable and trigger failover.
    /// Defaults to the whole 5xx class.
    #[serde(default)]
    pub failover_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub normalization: NormalizationConfig,
    /// Name of the error mapping policy applied to this trunk's failures
    #[serde(default)]
    pub error_mapping: Option<String>,
    /// Routing token attached to every destination of this trunk
    #[serde(default)]
    pub routing_hint: Option<String>,
    /// Logical network interface destinations are bound to
    #[serde(default)]
    pub network: Option<String>,
}

/// Request-URI pattern → trunk, consumed by the built-in pattern handler
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteRule {
    /// Regex matched against the Request-URI
    pub pattern: String,
    pub trunk: String,
    /// Restrict to these methods (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,
}

/// One rule of an error mapping policy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MappingRuleConfig {
    pub codes: Vec<u16>,
    pub code: u16,
    pub phrase: String,
}

/// Named error mapping policy
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorMappingConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<MappingRuleConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Root configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub trunks: HashMap<String, TrunkConfig>,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub error_mappings: Vec<ErrorMappingConfig>,
    /// Error mapping policy used when a trunk names none
    #[serde(default)]
    pub default_error_mapping: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Transaction timeout, falling back to the default budget when unparsable
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction
            .timeout_duration()
            .unwrap_or(Duration::from_secs(32))
    }
}
