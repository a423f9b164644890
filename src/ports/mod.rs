pub mod dns;
pub mod transport;
pub mod upstream;

pub use dns::{LookupError, RecordLookup, SrvRecord};
pub use transport::{Transport, TransportError};
pub use upstream::UpstreamSink;
