//! Trunkline - routing and transaction-orchestration core of a SIP signaling proxy.
//!
//! Trunkline sits behind an external signaling stack that owns message parsing and
//! transport. The stack hands over parsed requests; trunkline decides where each one
//! goes, relays it, fails over across alternate destinations, normalizes messages on
//! the way out and back, and maps internal failures to protocol-correct responses.
//!
//! # Features
//! - Destination resolution (literal IP, SRV with address fallback, static records)
//!   with per-lookup timeouts, retries and a TTL cache
//! - Deterministic, health-aware destination selection
//! - Sequential failover bounded by a per-transaction timeout
//! - Per-trunk header normalization at three points of the pipeline
//! - Named error-mapping policies for synthesized responses
//! - Maintenance mode, in-dialog passthrough and upstream cancellation
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use trunkline::{
//!     adapters::{Ingress, SystemLookup},
//!     config::loader::load_config,
//!     core::{
//!         ControllerSettings, DestinationResolver, ErrorMappingRegistry, LoadBalancer,
//!         PatternRequestHandler, ProxyAppConfig, ProxyController, ResponseInterest, TrunkManager,
//!         app_config::MaintenanceSwitch,
//!     },
//!     ports::{Transport, UpstreamSink},
//! };
//!
//! # async fn wire(transport: Arc<dyn Transport>, upstream: Arc<dyn UpstreamSink>) -> eyre::Result<()> {
//! let cfg = load_config("trunkline.toml").await?;
//! let lookup = Arc::new(SystemLookup::from_static(&cfg.resolver.static_records));
//! let resolver = Arc::new(DestinationResolver::new(lookup, &cfg.resolver));
//! let trunks = TrunkManager::from_config(&cfg, resolver, Arc::new(LoadBalancer::new()), transport)?;
//! let controller = Arc::new(ProxyController::new(
//!     Arc::new(trunks),
//!     Arc::new(ErrorMappingRegistry::from_config(&cfg.error_mappings)),
//!     upstream,
//!     ControllerSettings::from_config(&cfg),
//! ));
//! let app = ProxyAppConfig::new(
//!     Arc::new(PatternRequestHandler::from_rules(&cfg.routes)?),
//!     Arc::new(MaintenanceSwitch::from_config(&cfg.maintenance)),
//!     true,
//!     ResponseInterest::none(),
//!     None,
//! );
//! let (sender, ingress) = Ingress::from_config(&cfg.transaction, controller, app);
//! tokio::spawn(ingress.run(CancellationToken::new()));
//! # let _ = sender;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits towards the signaling stack and name
//! lookups) from **adapters** (implementations) while keeping routing logic inside
//! `core`.
//!
//! # Error Handling
//! Core operations return [`core::ProxyResult`]; every failure carries an
//! [`core::ErrorKind`] that selects the status code fed through error mapping.
//! Configuration and CLI code uses `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Each transaction is driven by one tokio task. Shared maps (health records,
//! resolver cache, live transactions) use `scc::HashMap`; the error-mapping
//! registry is an `arc_swap::ArcSwap` snapshot.
pub mod config;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HealthChecker, Ingress, IngressSender, SystemLookup},
    core::{ProxyController, TrunkManager},
};
