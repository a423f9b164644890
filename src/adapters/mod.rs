pub mod health_checker;
pub mod ingress;
pub mod system_dns;

pub use health_checker::HealthChecker;
pub use ingress::{InboundEvent, Ingress, IngressSender};
pub use system_dns::SystemLookup;
