//! Bounded hand-off from the signaling stack into the proxy core.
//!
//! The stack submits [`InboundEvent`]s through an [`IngressSender`]; a full
//! channel makes the sender wait instead of dropping events. One
//! [`Ingress`] loop drains the channel and dispatches to the controller until
//! its shutdown token fires or every sender is gone.
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::TransactionConfig,
    core::{
        app_config::ProxyAppConfig,
        controller::ProxyController,
        message::{Request, Response},
        transaction::TransactionId,
    },
};

/// Something the signaling stack hands over
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A new server transaction
    Request { id: TransactionId, request: Request },
    /// Upstream cancelled a pending request
    Cancel(TransactionId),
    /// A response that matched no client transaction
    StrayResponse(Response),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IngressError {
    #[error("Ingress channel is closed")]
    Closed,

    #[error("Ingress channel is full")]
    Full,
}

/// Producer side of the ingress channel
#[derive(Debug, Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<InboundEvent>,
}

impl IngressSender {
    /// Submit an event, waiting for capacity
    pub async fn submit(&self, event: InboundEvent) -> Result<(), IngressError> {
        self.tx.send(event).await.map_err(|_| IngressError::Closed)
    }

    /// Submit without waiting
    pub fn try_submit(&self, event: InboundEvent) -> Result<(), IngressError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngressError::Full,
            mpsc::error::TrySendError::Closed(_) => IngressError::Closed,
        })
    }

    /// Free slots left in the channel
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer side: drives the controller
pub struct Ingress {
    rx: mpsc::Receiver<InboundEvent>,
    controller: Arc<ProxyController>,
    app: ProxyAppConfig,
}

impl Ingress {
    /// Create the channel and its consumer
    pub fn new(capacity: usize, controller: Arc<ProxyController>, app: ProxyAppConfig) -> (IngressSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (IngressSender { tx }, Self { rx, controller, app })
    }

    /// Channel sized by `transaction.ingress_buffer`
    pub fn from_config(
        config: &TransactionConfig,
        controller: Arc<ProxyController>,
        app: ProxyAppConfig,
    ) -> (IngressSender, Self) {
        Self::new(config.ingress_buffer, controller, app)
    }

    /// Drain events until shutdown or until every sender is dropped.
    /// Returns the number of events dispatched.
    pub async fn run(mut self, shutdown: CancellationToken) -> usize {
        tracing::info!("Ingress loop started");
        let mut dispatched = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(dispatched, "Ingress loop stopped by shutdown");
                    break;
                }
                event = self.rx.recv() => event,
            };

            let Some(event) = event else {
                tracing::info!(dispatched, "Ingress channel closed");
                break;
            };
            self.dispatch(event).await;
            dispatched += 1;
        }

        dispatched
    }

    async fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::Request { id, request } => {
                self.controller.on_request(id, request, &self.app).await;
            }
            InboundEvent::Cancel(id) => {
                self.controller.on_cancel(&id).await;
            }
            InboundEvent::StrayResponse(response) => {
                self.controller.on_stray_response(response, &self.app);
            }
        }
    }
}
