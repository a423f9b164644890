pub mod app_config;
pub mod controller;
pub mod destination;
pub mod error;
pub mod error_mapping;
pub mod load_balancer;
pub mod message;
pub mod normalization;
pub mod resolver;
pub mod transaction;
pub mod trunk;

pub use app_config::{PatternRequestHandler, ProxyAppConfig, RequestHandler, ResponseInterest};
pub use controller::{ControllerSettings, ProxyController};
pub use destination::{Destination, DestinationType, Transport};
pub use error::{ErrorKind, ProxyError, ProxyResult};
pub use error_mapping::{ErrorMappingPolicy, ErrorMappingRegistry};
pub use load_balancer::LoadBalancer;
pub use resolver::DestinationResolver;
pub use transaction::{TransactionHandle, TransactionId, TransactionState};
pub use trunk::{EgressPolicy, TrunkManager};
