use crate::core::{message::Response, transaction::TransactionId};

/// UpstreamSink defines the port back into the signaling stack's server side.
///
/// `respond` is called exactly once per inbound request transaction. Calls
/// must not block: the stack is expected to queue the response for sending.
pub trait UpstreamSink: Send + Sync + 'static {
    /// Deliver the final response of a server transaction
    fn respond(&self, transaction: &TransactionId, response: Response);

    /// Relay a response that matched no transaction
    fn relay(&self, response: Response);
}
