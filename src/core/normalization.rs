//! Message normalization hooks.
//!
//! A trunk carries one [`Normalization`] with three independent slots:
//! * `normalize_request` runs on every outbound copy before a destination is chosen
//! * `normalize_selected` runs once the destination for this attempt is known
//! * `normalize_response` runs on the final response before it goes upstream
//!
//! Hooks run inline on the transaction task and must not block. The response
//! slot is never looked up globally: the trunk manager binds the trunk's
//! normalization to the transaction in a [`NormalizationCookie`], so
//! concurrent transactions on different trunks cannot cross-apply hooks.
use std::{fmt, sync::Arc};

use crate::{
    config::models::{HeaderActions, NormalizationConfig},
    core::{
        destination::Destination,
        message::{Headers, Request, Response},
        transaction::TransactionId,
    },
};

/// Pluggable message transformation. Every slot defaults to a no-op.
pub trait Normalization: Send + Sync + 'static {
    /// Mutate the outbound copy of the request
    fn normalize_request(&self, _request: &mut Request) {}

    /// Adjust the request for the destination chosen for this attempt
    fn normalize_selected(&self, _request: &mut Request, _destination: &Destination) {}

    /// Mutate the final response before delivery upstream
    fn normalize_response(&self, _response: &mut Response) {}
}

/// Leaves every message untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNormalization;

impl Normalization for NoopNormalization {}

/// Runs several normalizations in order
#[derive(Default, Clone)]
pub struct NormalizationChain {
    stages: Vec<Arc<dyn Normalization>>,
}

impl NormalizationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, stage: Arc<dyn Normalization>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl Normalization for NormalizationChain {
    fn normalize_request(&self, request: &mut Request) {
        for stage in &self.stages {
            stage.normalize_request(request);
        }
    }

    fn normalize_selected(&self, request: &mut Request, destination: &Destination) {
        for stage in &self.stages {
            stage.normalize_selected(request, destination);
        }
    }

    fn normalize_response(&self, response: &mut Response) {
        for stage in &self.stages {
            stage.normalize_response(response);
        }
    }
}

/// Header add/remove actions configured per trunk.
///
/// Values added in the post-selection slot may reference the chosen
/// destination with `{address}`, `{uri}`, `{transport}` and `{hint}`.
#[derive(Debug, Default, Clone)]
pub struct HeaderNormalization {
    request: HeaderActions,
    selected: HeaderActions,
    response: HeaderActions,
    route_to_destination: bool,
}

impl HeaderNormalization {
    pub fn from_config(config: &NormalizationConfig) -> Self {
        Self {
            request: config.request_headers.clone().unwrap_or_default(),
            selected: config.selected_headers.clone().unwrap_or_default(),
            response: config.response_headers.clone().unwrap_or_default(),
            route_to_destination: config.route_to_destination,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.request.is_empty()
            && self.selected.is_empty()
            && self.response.is_empty()
            && !self.route_to_destination
    }
}

fn apply_actions(headers: &mut Headers, actions: &HeaderActions, expand: impl Fn(&str) -> String) {
    for name in &actions.remove {
        headers.remove(name);
    }
    // Sorted so repeated runs produce identical header order
    let mut added: Vec<_> = actions.add.iter().collect();
    added.sort();
    for (name, value) in added {
        headers.set(name.clone(), expand(value));
    }
}

impl Normalization for HeaderNormalization {
    fn normalize_request(&self, request: &mut Request) {
        apply_actions(&mut request.headers, &self.request, str::to_string);
    }

    fn normalize_selected(&self, request: &mut Request, destination: &Destination) {
        apply_actions(&mut request.headers, &self.selected, |value| {
            value
                .replace("{address}", destination.address())
                .replace("{uri}", destination.uri())
                .replace("{transport}", &destination.transport().to_string())
                .replace("{hint}", destination.routing_hint().unwrap_or_default())
        });
        if self.route_to_destination {
            request
                .headers
                .prepend("Route", format!("<{};lr>", destination.uri()));
        }
    }

    fn normalize_response(&self, response: &mut Response) {
        apply_actions(&mut response.headers, &self.response, str::to_string);
    }
}

/// Build the normalization for a trunk from its configuration
pub fn from_config(config: &NormalizationConfig) -> Arc<dyn Normalization> {
    let headers = HeaderNormalization::from_config(config);
    if headers.is_noop() {
        Arc::new(NoopNormalization)
    } else {
        Arc::new(headers)
    }
}

/// Binds a trunk's normalization to one transaction so its response slot is
/// reached through the transaction rather than a global lookup.
#[derive(Clone)]
pub struct NormalizationCookie {
    transaction: TransactionId,
    trunk: String,
    normalization: Arc<dyn Normalization>,
}

impl NormalizationCookie {
    pub fn new(
        transaction: TransactionId,
        trunk: impl Into<String>,
        normalization: Arc<dyn Normalization>,
    ) -> Self {
        Self {
            transaction,
            trunk: trunk.into(),
            normalization,
        }
    }

    pub fn transaction(&self) -> &TransactionId {
        &self.transaction
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Apply the bound response normalization
    pub fn normalize_response(&self, response: &mut Response) {
        self.normalization.normalize_response(response);
    }
}

impl fmt::Debug for NormalizationCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizationCookie")
            .field("transaction", &self.transaction)
            .field("trunk", &self.trunk)
            .finish_non_exhaustive()
    }
}
