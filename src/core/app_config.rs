//! Application-facing configuration consumed by the transaction controller.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use regex::Regex;
use thiserror::Error;

use crate::{
    config::models::{MaintenanceConfig, RouteRule},
    core::{
        message::{Request, Response},
        normalization::Normalization,
    },
};

/// Misuse of the response-interest vector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterestError {
    #[error("Response class {0} is outside 1..=6")]
    OutOfRange(u8),
}

/// Which response classes (1xx..6xx) the application wants to be told about.
///
/// Interest gates application notification only: responses are proxied
/// upstream whatever the application registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseInterest([bool; 6]);

impl ResponseInterest {
    /// `flags[0]` is class 1 (provisional) ... `flags[5]` is class 6
    pub fn new(flags: [bool; 6]) -> Self {
        Self(flags)
    }

    pub fn all() -> Self {
        Self([true; 6])
    }

    pub fn none() -> Self {
        Self([false; 6])
    }

    /// Configured flag for `class`, which must be within 1..=6
    pub fn get(&self, class: u8) -> Result<bool, InterestError> {
        match class {
            1..=6 => Ok(self.0[usize::from(class) - 1]),
            other => Err(InterestError::OutOfRange(other)),
        }
    }

    /// Whether a response with this status should be reported. Statuses
    /// outside the six classes are never reported.
    pub fn wants(&self, status: u16) -> bool {
        u8::try_from(status / 100)
            .ok()
            .and_then(|class| self.get(class).ok())
            .unwrap_or(false)
    }
}

/// Application hook deciding how new requests are routed
pub trait RequestHandler: Send + Sync + 'static {
    /// Trunk (egress policy name) for a new-dialog request; `None` means no route
    fn select_trunk(&self, request: &Request) -> Option<String>;

    /// Called for responses in classes the application registered interest for
    fn on_response(&self, _request: &Request, _response: &Response) {}
}

/// Source of the maintenance-mode flag, read once per inbound request
pub trait MaintenanceSupplier: Send + Sync + 'static {
    fn is_maintenance(&self) -> bool;
}

impl<F> MaintenanceSupplier for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_maintenance(&self) -> bool {
        self()
    }
}

/// Runtime switch for maintenance mode
#[derive(Debug, Default)]
pub struct MaintenanceSwitch(AtomicBool);

impl MaintenanceSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    /// Switch starting in the configured state
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        if config.enabled {
            tracing::warn!("Starting in maintenance mode");
        }
        Self::new(config.enabled)
    }

    pub fn set(&self, enabled: bool) {
        let previous = self.0.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            tracing::info!(enabled, "Maintenance mode changed");
        }
    }
}

impl MaintenanceSupplier for MaintenanceSwitch {
    fn is_maintenance(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-application proxy configuration
#[derive(Clone)]
pub struct ProxyAppConfig {
    request_handler: Arc<dyn RequestHandler>,
    maintenance: Arc<dyn MaintenanceSupplier>,
    mid_dialog: bool,
    interest: ResponseInterest,
    stray_response_normalizer: Option<Arc<dyn Normalization>>,
}

impl ProxyAppConfig {
    /// # Arguments
    /// * `request_handler` - routes new requests and receives notifications
    /// * `maintenance` - maintenance flag source
    /// * `mid_dialog` - whether the application is notified about in-dialog
    ///   transactions (they are proxied along their route either way)
    /// * `interest` - response classes the application is notified of
    /// * `stray_response_normalizer` - applied to responses matching no transaction
    pub fn new(
        request_handler: Arc<dyn RequestHandler>,
        maintenance: Arc<dyn MaintenanceSupplier>,
        mid_dialog: bool,
        interest: ResponseInterest,
        stray_response_normalizer: Option<Arc<dyn Normalization>>,
    ) -> Self {
        Self {
            request_handler,
            maintenance,
            mid_dialog,
            interest,
            stray_response_normalizer,
        }
    }

    /// Defaults: never in maintenance, mid-dialog notifications on, no
    /// interest, no stray-response normalizer.
    pub fn with_handler(request_handler: Arc<dyn RequestHandler>) -> Self {
        Self::new(
            request_handler,
            Arc::new(MaintenanceSwitch::new(false)),
            true,
            ResponseInterest::none(),
            None,
        )
    }

    pub fn request_handler(&self) -> &Arc<dyn RequestHandler> {
        &self.request_handler
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.is_maintenance()
    }

    pub fn mid_dialog(&self) -> bool {
        self.mid_dialog
    }

    pub fn interest(&self) -> ResponseInterest {
        self.interest
    }

    /// Range-checked interest lookup
    pub fn get_interest(&self, class: u8) -> Result<bool, InterestError> {
        self.interest.get(class)
    }

    pub fn stray_response_normalizer(&self) -> Option<&Arc<dyn Normalization>> {
        self.stray_response_normalizer.as_ref()
    }
}

struct CompiledRoute {
    pattern: Regex,
    trunk: String,
    methods: Vec<String>,
}

/// Request handler routing on Request-URI patterns from configuration.
/// The first matching rule wins.
pub struct PatternRequestHandler {
    routes: Vec<CompiledRoute>,
}

impl PatternRequestHandler {
    pub fn from_rules(rules: &[RouteRule]) -> Result<Self, regex::Error> {
        let routes = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRoute {
                    pattern: Regex::new(&rule.pattern)?,
                    trunk: rule.trunk.clone(),
                    methods: rule.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { routes })
    }
}

impl RequestHandler for PatternRequestHandler {
    fn select_trunk(&self, request: &Request) -> Option<String> {
        let uri = request.uri.to_string();
        let method = request.method.to_ascii_uppercase();
        self.routes
            .iter()
            .find(|route| {
                (route.methods.is_empty() || route.methods.contains(&method))
                    && route.pattern.is_match(&uri)
            })
            .map(|route| route.trunk.clone())
    }
}
