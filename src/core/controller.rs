//! Proxy transaction controller.
//!
//! Entry point for requests handed over by the signaling stack. Each routed
//! transaction is driven by one spawned task bounded by the transaction
//! timeout; the controller owns every terminal transition and is the only
//! place a final response is sent upstream.
use std::{sync::Arc, time::Duration};

use scc::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::models::ProxyConfig,
    core::{
        app_config::ProxyAppConfig,
        error::{ProxyError, ProxyResult},
        error_mapping::ErrorMappingRegistry,
        message::{Request, Response},
        transaction::{ProxyTransaction, TransactionHandle, TransactionId},
        trunk::TrunkManager,
    },
    ports::upstream::UpstreamSink,
    tracing_setup::create_transaction_span,
};

const TIMEOUT_STATUS: u16 = 408;
const CANCELLED_STATUS: u16 = 487;

/// Controller knobs taken from configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub transaction_timeout: Duration,
    pub maintenance_status: u16,
    pub maintenance_reason: String,
    /// Error mapping policy for transactions whose trunk names none
    pub default_error_mapping: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            transaction_timeout: config.transaction_timeout(),
            maintenance_status: config.maintenance.status_code,
            maintenance_reason: config.maintenance.reason.clone(),
            default_error_mapping: config.default_error_mapping.clone(),
        }
    }
}

#[derive(Clone)]
struct LiveTransaction {
    handle: TransactionHandle,
    cancel: CancellationToken,
}

pub struct ProxyController {
    trunks: Arc<TrunkManager>,
    mappings: Arc<ErrorMappingRegistry>,
    upstream: Arc<dyn UpstreamSink>,
    settings: ControllerSettings,
    transactions: HashMap<TransactionId, LiveTransaction>,
}

impl ProxyController {
    pub fn new(
        trunks: Arc<TrunkManager>,
        mappings: Arc<ErrorMappingRegistry>,
        upstream: Arc<dyn UpstreamSink>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            trunks,
            mappings,
            upstream,
            settings,
            transactions: HashMap::new(),
        }
    }

    pub fn trunks(&self) -> &Arc<TrunkManager> {
        &self.trunks
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Handle of a live (non-terminal) transaction
    pub async fn transaction(&self, id: &TransactionId) -> Option<TransactionHandle> {
        self.transactions
            .get_async(id)
            .await
            .map(|entry| entry.get().handle.clone())
    }

    /// Number of transactions still in flight
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Accept a new inbound request.
    ///
    /// Maintenance rejections and routing failures are answered before this
    /// returns. Everything else is dispatched to a task; use
    /// [`TransactionHandle::wait_terminal`] to await the outcome.
    pub async fn on_request(
        self: &Arc<Self>,
        id: TransactionId,
        request: Request,
        app: &ProxyAppConfig,
    ) -> TransactionHandle {
        if let Some(existing) = self.transaction(&id).await {
            tracing::debug!(transaction = %id, "Duplicate request for live transaction ignored");
            return existing;
        }

        let span = create_transaction_span(id.as_str(), &request.method, request.call_id());
        let handle = TransactionHandle::new(ProxyTransaction::new(id.clone(), request.clone(), app.interest()));

        if app.is_maintenance() {
            tracing::info!(
                parent: &span,
                status = self.settings.maintenance_status,
                "Rejecting request in maintenance mode"
            );
            let response = Response::for_request(
                &request,
                self.settings.maintenance_status,
                Some(&self.settings.maintenance_reason),
            );
            if handle.with(|tx| tx.fail()).is_ok() {
                span.record("sip.status_code", response.status);
                self.upstream.respond(&id, response);
            }
            return handle;
        }

        let cancel = CancellationToken::new();
        let live = LiveTransaction {
            handle: handle.clone(),
            cancel: cancel.clone(),
        };
        if self.transactions.insert_async(id.clone(), live).await.is_err() {
            // Lost a race with a concurrent duplicate
            if let Some(existing) = self.transaction(&id).await {
                return existing;
            }
        }

        if request.is_mid_dialog() {
            self.dispatch_in_dialog(handle.clone(), request, app.clone(), cancel, span);
            return handle;
        }

        let routed = app
            .request_handler()
            .select_trunk(&request)
            .ok_or_else(|| ProxyError::no_route(format!("no trunk for {}", request.uri)))
            .and_then(|trunk| {
                self.trunks
                    .policy(&trunk)
                    .map(|policy| (trunk.clone(), policy))
                    .ok_or_else(|| ProxyError::no_route(format!("unknown trunk {trunk}")))
            })
            .and_then(|(trunk, policy)| {
                let mapping = policy
                    .error_mapping()
                    .map(str::to_string)
                    .or_else(|| self.settings.default_error_mapping.clone());
                handle.with(|tx| tx.route_via(&trunk, mapping))?;
                Ok((trunk, policy))
            });

        let (trunk, policy) = match routed {
            Ok(routed) => routed,
            Err(error) => {
                tracing::info!(parent: &span, %error, "Request not routable");
                self.on_egress_result(&handle, Err(error), app).await;
                return handle;
            }
        };
        span.record("trunk", trunk.as_str());

        let controller = Arc::clone(self);
        let task_handle = handle.clone();
        let task_app = app.clone();
        self.supervise(handle.clone(), app.clone(), span, async move {
            let egress = controller.trunks.handle_egress(
                &trunk,
                &request,
                &policy,
                policy.normalization(),
                &task_handle,
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Egress aborted by cancellation");
                }
                outcome = tokio::time::timeout(controller.settings.transaction_timeout, egress) => {
                    match outcome {
                        Ok(result) => {
                            controller.on_egress_result(&task_handle, result, &task_app).await;
                        }
                        Err(_) => {
                            controller.on_timeout(&task_handle).await;
                        }
                    }
                }
            }
        });

        handle
    }

    fn dispatch_in_dialog(
        self: &Arc<Self>,
        handle: TransactionHandle,
        request: Request,
        app: ProxyAppConfig,
        cancel: CancellationToken,
        span: tracing::Span,
    ) {
        let controller = Arc::clone(self);
        let task_handle = handle.clone();
        let task_app = app.clone();
        self.supervise(handle, app, span, async move {
            tracing::debug!("Proxying in-dialog request along its route");
            let send = controller.trunks.send_in_dialog(&request, &task_handle);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("In-dialog request aborted by cancellation");
                }
                outcome = tokio::time::timeout(controller.settings.transaction_timeout, send) => {
                    match outcome {
                        Ok(result) => {
                            controller.on_egress_result(&task_handle, result, &task_app).await;
                        }
                        Err(_) => {
                            controller.on_timeout(&task_handle).await;
                        }
                    }
                }
            }
        });
    }

    /// Run a transaction task and answer 500 through error mapping if it
    /// dies before reaching a terminal state.
    fn supervise<F>(self: &Arc<Self>, handle: TransactionHandle, app: ProxyAppConfig, span: tracing::Span, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = tokio::spawn(task.instrument(span.clone()));
        let controller = Arc::clone(self);
        tokio::spawn(
            async move {
                if let Err(error) = worker.await {
                    tracing::error!(transaction = %handle.id(), %error, "Transaction task died");
                    let fault = ProxyError::internal(format!("transaction task died: {error}"));
                    controller.on_egress_result(&handle, Err(fault), &app).await;
                }
            }
            .instrument(span),
        );
    }

    /// Finalize a transaction with the outcome of its egress.
    ///
    /// Returns `false` without side effects when the transaction had already
    /// reached a terminal state (late callback after a timeout, cancel or an
    /// earlier result).
    pub async fn on_egress_result(
        &self,
        handle: &TransactionHandle,
        outcome: ProxyResult<Response>,
        app: &ProxyAppConfig,
    ) -> bool {
        let finalized = match outcome {
            Ok(response) => self.complete(handle, response, app),
            Err(error) => self.fail(handle, &error),
        };
        if finalized {
            self.forget(handle.id()).await;
        }
        finalized
    }

    fn complete(&self, handle: &TransactionHandle, response: Response, app: &ProxyAppConfig) -> bool {
        let Ok((request, interest, mid_dialog)) = handle.with(|tx| {
            tx.complete()
                .map(|_| (tx.request().clone(), tx.interest(), tx.is_mid_dialog()))
        }) else {
            tracing::debug!(transaction = %handle.id(), "Ignoring response for finished transaction");
            return false;
        };

        tracing::Span::current().record("sip.status_code", response.status);
        if interest.wants(response.status) && (!mid_dialog || app.mid_dialog()) {
            app.request_handler().on_response(&request, &response);
        }
        tracing::info!(
            transaction = %handle.id(),
            status = response.status,
            attempts = handle.attempts(),
            "Transaction completed"
        );
        self.upstream.respond(handle.id(), response);
        true
    }

    fn fail(&self, handle: &TransactionHandle, error: &ProxyError) -> bool {
        let Ok((request, mapping)) = handle.with(|tx| {
            tx.fail()
                .map(|_| (tx.request().clone(), tx.error_mapping().map(str::to_string)))
        }) else {
            tracing::debug!(transaction = %handle.id(), %error, "Ignoring failure for finished transaction");
            return false;
        };

        let mapping = mapping.or_else(|| self.settings.default_error_mapping.clone());
        let (status, phrase) = self.mappings.map_code(mapping.as_deref(), error.status_code());
        let response = Response::for_request(&request, status, phrase.as_deref());
        tracing::Span::current().record("sip.status_code", status);
        tracing::warn!(
            transaction = %handle.id(),
            kind = %error.kind(),
            %error,
            status,
            "Transaction failed"
        );
        self.upstream.respond(handle.id(), response);
        true
    }

    /// The transaction budget elapsed. No-op on finished transactions.
    pub async fn on_timeout(&self, handle: &TransactionHandle) -> bool {
        let Ok((request, mapping)) = handle.with(|tx| {
            tx.time_out()
                .map(|_| (tx.request().clone(), tx.error_mapping().map(str::to_string)))
        }) else {
            return false;
        };

        let mapping = mapping.or_else(|| self.settings.default_error_mapping.clone());
        let (status, phrase) = self.mappings.map_code(mapping.as_deref(), TIMEOUT_STATUS);
        tracing::warn!(
            transaction = %handle.id(),
            attempts = handle.attempts(),
            timeout = ?self.settings.transaction_timeout,
            "Transaction timed out"
        );
        self.upstream
            .respond(handle.id(), Response::for_request(&request, status, phrase.as_deref()));
        self.forget(handle.id()).await;
        true
    }

    /// Upstream cancelled the request: abort any in-flight egress and answer
    /// 487. Returns `false` if the transaction is unknown or already finished.
    pub async fn on_cancel(&self, id: &TransactionId) -> bool {
        let Some(live) = self.transactions.get_async(id).await.map(|entry| entry.get().clone()) else {
            tracing::debug!(transaction = %id, "Cancel for unknown transaction");
            return false;
        };

        let Ok(request) = live.handle.with(|tx| tx.fail().map(|_| tx.request().clone())) else {
            return false;
        };
        live.cancel.cancel();
        tracing::info!(transaction = %id, "Transaction cancelled");
        self.upstream
            .respond(id, Response::for_request(&request, CANCELLED_STATUS, None));
        self.forget(id).await;
        true
    }

    /// Relay a response that matched no transaction, after the application's
    /// stray-response normalizer.
    pub fn on_stray_response(&self, mut response: Response, app: &ProxyAppConfig) {
        if let Some(normalizer) = app.stray_response_normalizer() {
            normalizer.normalize_response(&mut response);
        }
        tracing::debug!(status = response.status, "Relaying stray response");
        self.upstream.relay(response);
    }

    async fn forget(&self, id: &TransactionId) {
        let _ = self.transactions.remove_async(id).await;
    }
}
