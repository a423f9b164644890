//! Trunk (egress) management: where a routed request goes and how failover
//! across candidate destinations is driven.
use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::Arc,
    time::Instant,
};

use thiserror::Error;
use tracing::Instrument;

use crate::{
    config::models::{ProxyConfig, TargetConfig, TrunkConfig},
    core::{
        destination::{Destination, DestinationError, DestinationType, Transport},
        error::{ProxyError, ProxyResult},
        load_balancer::LoadBalancer,
        message::{Request, Response, SipUri, UriError},
        normalization::{self, Normalization, NormalizationCookie, NoopNormalization},
        resolver::DestinationResolver,
        transaction::AttemptTracker,
    },
    ports::transport::Transport as SignalingTransport,
    tracing_setup::create_attempt_span,
};

const DEFAULT_FAILOVER_CODES: RangeInclusive<u16> = 500..=599;

/// Errors while building egress policies from configuration
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TrunkConfigError {
    #[error("Trunk {trunk}: invalid destination URI {uri}: {source}")]
    InvalidUri {
        trunk: String,
        uri: String,
        source: UriError,
    },

    #[error("Trunk {trunk}: {source}")]
    InvalidDestination {
        trunk: String,
        source: DestinationError,
    },
}

/// Where candidate destinations of a trunk come from
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationSource {
    /// Fixed server group, tried in preference order
    Static(Vec<Destination>),
    /// Name handed to the destination resolver on every request
    Resolve {
        name: String,
        transport: Option<Transport>,
        port: Option<u16>,
    },
}

/// Response codes that make the trunk manager move on to the next candidate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailoverPolicy {
    codes: Option<Vec<u16>>,
}

impl FailoverPolicy {
    /// Fail over on exactly these codes
    pub fn on_codes(codes: Vec<u16>) -> Self {
        Self { codes: Some(codes) }
    }

    pub fn should_failover(&self, status: u16) -> bool {
        match &self.codes {
            Some(codes) => codes.contains(&status),
            None => DEFAULT_FAILOVER_CODES.contains(&status),
        }
    }
}

/// Immutable egress policy of one trunk
#[derive(Clone)]
pub struct EgressPolicy {
    name: String,
    source: DestinationSource,
    normalization: Arc<dyn Normalization>,
    failover: FailoverPolicy,
    error_mapping: Option<String>,
    routing_hint: Option<String>,
    network: Option<String>,
}

impl EgressPolicy {
    pub fn new(name: impl Into<String>, source: DestinationSource) -> Self {
        Self {
            name: name.into(),
            source,
            normalization: Arc::new(NoopNormalization),
            failover: FailoverPolicy::default(),
            error_mapping: None,
            routing_hint: None,
            network: None,
        }
    }

    pub fn with_normalization(mut self, normalization: Arc<dyn Normalization>) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_failover(mut self, failover: FailoverPolicy) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_error_mapping(mut self, policy: impl Into<String>) -> Self {
        self.error_mapping = Some(policy.into());
        self
    }

    pub fn with_routing_hint(mut self, hint: impl Into<String>) -> Self {
        self.routing_hint = Some(hint.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Build a trunk's policy from its configuration section.
    /// `default_error_mapping` applies when the trunk names none.
    pub fn from_config(
        name: &str,
        config: &TrunkConfig,
        default_error_mapping: Option<&str>,
    ) -> Result<Self, TrunkConfigError> {
        let source = match &config.target {
            TargetConfig::Static { destinations } => {
                let mut built = Vec::with_capacity(destinations.len());
                for entry in destinations {
                    let uri = SipUri::parse(&entry.uri).map_err(|source| TrunkConfigError::InvalidUri {
                        trunk: name.to_string(),
                        uri: entry.uri.clone(),
                        source,
                    })?;
                    let mut destination =
                        Destination::from_uri(DestinationType::ServerGroup, &uri, entry.preference)
                            .map_err(|source| TrunkConfigError::InvalidDestination {
                                trunk: name.to_string(),
                                source,
                            })?;
                    if let Some(network) = entry.network.as_ref().or(config.network.as_ref()) {
                        destination = destination.with_network(network.clone());
                    }
                    if let Some(hint) = &config.routing_hint {
                        destination = destination.with_routing_hint(hint.clone());
                    }
                    built.push(destination);
                }
                DestinationSource::Static(built)
            }
            TargetConfig::Resolve {
                name: target,
                transport,
                port,
            } => DestinationSource::Resolve {
                name: target.clone(),
                transport: *transport,
                port: *port,
            },
        };

        Ok(Self {
            name: name.to_string(),
            source,
            normalization: normalization::from_config(&config.normalization),
            failover: config
                .failover_codes
                .clone()
                .map(FailoverPolicy::on_codes)
                .unwrap_or_default(),
            error_mapping: config
                .error_mapping
                .clone()
                .or_else(|| default_error_mapping.map(str::to_string)),
            routing_hint: config.routing_hint.clone(),
            network: config.network.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &DestinationSource {
        &self.source
    }

    pub fn normalization(&self) -> Arc<dyn Normalization> {
        self.normalization.clone()
    }

    pub fn failover(&self) -> &FailoverPolicy {
        &self.failover
    }

    pub fn error_mapping(&self) -> Option<&str> {
        self.error_mapping.as_deref()
    }

    pub fn routing_hint(&self) -> Option<&str> {
        self.routing_hint.as_deref()
    }
}

impl std::fmt::Debug for EgressPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressPolicy")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("failover", &self.failover)
            .field("error_mapping", &self.error_mapping)
            .field("routing_hint", &self.routing_hint)
            .finish_non_exhaustive()
    }
}

/// Drives egress for routed requests
pub struct TrunkManager {
    resolver: Arc<DestinationResolver>,
    balancer: Arc<LoadBalancer>,
    transport: Arc<dyn SignalingTransport>,
    policies: HashMap<String, Arc<EgressPolicy>>,
}

impl TrunkManager {
    pub fn new(
        resolver: Arc<DestinationResolver>,
        balancer: Arc<LoadBalancer>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self {
            resolver,
            balancer,
            transport,
            policies: HashMap::new(),
        }
    }

    /// Build every trunk declared in `config`
    pub fn from_config(
        config: &ProxyConfig,
        resolver: Arc<DestinationResolver>,
        balancer: Arc<LoadBalancer>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<Self, TrunkConfigError> {
        let mut manager = Self::new(resolver, balancer, transport);
        for (name, trunk) in &config.trunks {
            let policy = EgressPolicy::from_config(name, trunk, config.default_error_mapping.as_deref())?;
            manager.add_policy(policy);
        }
        tracing::info!(trunks = manager.policies.len(), "Egress policies loaded");
        Ok(manager)
    }

    /// Register (or replace) a policy under its name
    pub fn add_policy(&mut self, policy: EgressPolicy) {
        self.policies.insert(policy.name().to_string(), Arc::new(policy));
    }

    pub fn policy(&self, name: &str) -> Option<Arc<EgressPolicy>> {
        self.policies.get(name).cloned()
    }

    pub fn policy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn resolver(&self) -> &Arc<DestinationResolver> {
        &self.resolver
    }

    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    /// Candidate destinations of `policy`, in resolver/configuration order
    pub async fn candidates(&self, policy: &EgressPolicy) -> ProxyResult<Vec<Destination>> {
        let candidates = match policy.source() {
            DestinationSource::Static(destinations) => destinations.clone(),
            DestinationSource::Resolve {
                name,
                transport,
                port,
            } => {
                let resolved = match policy.routing_hint() {
                    Some(hint) => {
                        self.resolver
                            .resolve_with_hint(name, *transport, *port, hint)
                            .await?
                    }
                    None => self.resolver.resolve(name, *transport, *port).await?,
                };
                match &policy.network {
                    Some(network) => resolved
                        .into_iter()
                        .map(|destination| destination.with_network(network.clone()))
                        .collect(),
                    None => resolved,
                }
            }
        };
        Ok(candidates)
    }

    /// Route `request` through `policy`, failing over across candidates
    /// until one gives a usable response or all have been tried.
    ///
    /// The inbound request is never mutated: each attempt sends its own
    /// normalized copy.
    pub async fn handle_egress(
        &self,
        trunk_type: &str,
        request: &Request,
        policy: &EgressPolicy,
        normalization: Arc<dyn Normalization>,
        tracker: &dyn AttemptTracker,
    ) -> ProxyResult<Response> {
        tracker.resolving()?;
        let candidates = self.candidates(policy).await?;
        tracker.candidates(&candidates)?;
        for candidate in &candidates {
            self.balancer.track(candidate).await;
        }

        let cookie = NormalizationCookie::new(tracker.transaction_id(), trunk_type, normalization.clone());
        tracker.bind_cookie(cookie.clone())?;

        let mut excluded = HashSet::new();
        let mut attempts = 0;
        let mut last_status = None;

        loop {
            let Some(destination) = self.balancer.select(&candidates, &excluded).await else {
                tracing::warn!(
                    trunk = trunk_type,
                    attempts,
                    last_status,
                    "All candidate destinations failed"
                );
                return Err(ProxyError::unreachable(attempts, last_status));
            };

            let attempt = tracker.begin_attempt(&destination)?;
            attempts += 1;

            let mut outbound = request.clone();
            normalization.normalize_request(&mut outbound);
            normalization.normalize_selected(&mut outbound, &destination);
            tracker.attempt_sent()?;

            let span = create_attempt_span(trunk_type, destination.address(), attempt);
            let started = Instant::now();
            let result = self
                .transport
                .send(outbound, &destination)
                .instrument(span.clone())
                .await;
            span.record("duration_ms", started.elapsed().as_millis() as u64);

            match result {
                Ok(mut response) if !policy.failover().should_failover(response.status) => {
                    span.record("sip.status_code", response.status);
                    tracing::debug!(
                        parent: &span,
                        status = response.status,
                        "Destination answered"
                    );
                    cookie.normalize_response(&mut response);
                    return Ok(response);
                }
                Ok(response) => {
                    span.record("sip.status_code", response.status);
                    tracing::warn!(
                        parent: &span,
                        status = response.status,
                        "Failover status from destination"
                    );
                    last_status = Some(response.status);
                }
                Err(error) => {
                    tracing::warn!(parent: &span, %error, "Failed to reach destination");
                }
            }

            tracker.attempt_failed(&destination)?;
            excluded.insert(destination.key());
        }
    }

    /// Send an in-dialog request along its established route (top `Route`
    /// header, otherwise the Request-URI). One attempt, no resolver, no
    /// balancer and no failover.
    pub async fn send_in_dialog(
        &self,
        request: &Request,
        tracker: &dyn AttemptTracker,
    ) -> ProxyResult<Response> {
        let route = request
            .dialog_route()
            .map_err(|e| ProxyError::no_route(format!("unusable dialog route: {e}")))?;
        let destination = Destination::from_uri(DestinationType::Default, &route, Destination::DEFAULT_PREFERENCE)
            .map_err(|e| ProxyError::no_route(format!("unusable dialog route: {e}")))?;

        tracker.begin_attempt(&destination)?;
        tracker.attempt_sent()?;
        match self.transport.send(request.clone(), &destination).await {
            Ok(response) => Ok(response),
            Err(error) => {
                tracing::warn!(destination = %destination, %error, "In-dialog request failed");
                tracker.attempt_failed(&destination)?;
                Err(ProxyError::unreachable(1, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Mutex, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::models::{DestinationConfig, NormalizationConfig, ResolverConfig},
        core::{
            app_config::ResponseInterest,
            error::ErrorKind,
            transaction::{ProxyTransaction, TransactionHandle, TransactionId, TransactionState},
        },
        ports::{
            dns::{LookupError, LookupResult, RecordLookup, SrvRecord},
            transport::{TransportError, TransportResult},
        },
    };

    struct NoLookup;

    #[async_trait]
    impl RecordLookup for NoLookup {
        async fn lookup_srv(&self, name: &str) -> LookupResult<Vec<SrvRecord>> {
            Err(LookupError::NotFound(name.to_string()))
        }

        async fn lookup_addresses(&self, host: &str, _port: u16) -> LookupResult<Vec<SocketAddr>> {
            Err(LookupError::NotFound(host.to_string()))
        }
    }

    /// Answers per destination address; unknown addresses get a connection error
    struct ScriptedTransport {
        answers: HashMap<String, u16>,
        sent: Mutex<Vec<(String, Request)>>,
    }

    impl ScriptedTransport {
        fn new(answers: &[(&str, u16)]) -> Self {
            Self {
                answers: answers.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(a, _)| a.clone()).collect()
        }
    }

    #[async_trait]
    impl SignalingTransport for ScriptedTransport {
        async fn send(&self, request: Request, destination: &Destination) -> TransportResult<Response> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.address().to_string(), request.clone()));
            match self.answers.get(destination.address()) {
                Some(status) => Ok(Response::for_request(&request, *status, None)),
                None => Err(TransportError::ConnectionError(destination.address().to_string())),
            }
        }

        async fn probe(&self, _destination: &Destination, _timeout: Duration) -> TransportResult<bool> {
            Ok(true)
        }
    }

    fn manager(transport: Arc<ScriptedTransport>) -> TrunkManager {
        TrunkManager::new(
            Arc::new(DestinationResolver::new(Arc::new(NoLookup), &ResolverConfig::default())),
            Arc::new(LoadBalancer::new()),
            transport,
        )
    }

    fn static_trunk(destinations: &[(&str, f32)]) -> TrunkConfig {
        TrunkConfig {
            target: TargetConfig::Static {
                destinations: destinations
                    .iter()
                    .map(|(uri, preference)| DestinationConfig {
                        uri: uri.to_string(),
                        preference: *preference,
                        network: None,
                    })
                    .collect(),
            },
            failover_codes: None,
            normalization: NormalizationConfig::default(),
            error_mapping: None,
            routing_hint: None,
            network: None,
        }
    }

    fn request() -> Request {
        Request::new("INVITE", SipUri::parse("sip:+15551234@example.com").unwrap())
            .with_header("Call-ID", "abc@host")
    }

    fn handle() -> TransactionHandle {
        TransactionHandle::new(ProxyTransaction::new(
            TransactionId::generate(),
            request(),
            ResponseInterest::none(),
        ))
    }

    #[test]
    fn test_failover_policy_defaults_to_5xx() {
        let policy = FailoverPolicy::default();
        assert!(policy.should_failover(500));
        assert!(policy.should_failover(503));
        assert!(!policy.should_failover(486));
        assert!(!policy.should_failover(600));

        let custom = FailoverPolicy::on_codes(vec![408, 503]);
        assert!(custom.should_failover(408));
        assert!(!custom.should_failover(500));
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = static_trunk(&[("sip:10.0.0.1:5060;transport=tcp", 0.5)]);
        config.routing_hint = Some("carrier-a".to_string());
        config.failover_codes = Some(vec![503]);

        let policy = EgressPolicy::from_config("pstn", &config, Some("default-map")).unwrap();
        assert_eq!(policy.name(), "pstn");
        assert_eq!(policy.error_mapping(), Some("default-map"));
        assert!(policy.failover().should_failover(503));
        assert!(!policy.failover().should_failover(500));
        match policy.source() {
            DestinationSource::Static(destinations) => {
                assert_eq!(destinations.len(), 1);
                assert_eq!(destinations[0].transport(), Transport::Tcp);
                assert_eq!(destinations[0].routing_hint(), Some("carrier-a"));
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_policy_from_config_rejects_bad_uri() {
        let config = static_trunk(&[("http://nope", 1.0)]);
        let err = EgressPolicy::from_config("bad", &config, None).unwrap_err();
        assert!(matches!(err, TrunkConfigError::InvalidUri { .. }));
    }

    #[tokio::test]
    async fn test_fails_over_to_next_preference() {
        let transport = Arc::new(ScriptedTransport::new(&[("10.0.0.2:5060", 503), ("10.0.0.1:5060", 200)]));
        let manager = manager(transport.clone());
        let policy = EgressPolicy::from_config(
            "pstn",
            &static_trunk(&[("sip:10.0.0.1", 0.5), ("sip:10.0.0.2", 1.0)]),
            None,
        )
        .unwrap();
        let tracker = handle();

        let response = manager
            .handle_egress("pstn", &request(), &policy, policy.normalization(), &tracker)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(tracker.attempts(), 2);
        assert_eq!(transport.sent_to(), vec!["10.0.0.2:5060", "10.0.0.1:5060"]);
        assert!(tracker.cookie().is_some());
    }

    #[tokio::test]
    async fn test_exhausts_every_candidate() {
        let transport = Arc::new(ScriptedTransport::new(&[("10.0.0.3:5060", 500)]));
        let manager = manager(transport.clone());
        let policy = EgressPolicy::from_config(
            "pstn",
            &static_trunk(&[("sip:10.0.0.1", 1.0), ("sip:10.0.0.2", 0.8), ("sip:10.0.0.3", 0.1)]),
            None,
        )
        .unwrap();
        let tracker = handle();

        let err = manager
            .handle_egress("pstn", &request(), &policy, policy.normalization(), &tracker)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DestinationUnreachable);
        assert_eq!(err.received_status(), Some(500));
        assert_eq!(tracker.attempts(), 3);
        assert_eq!(transport.sent_to().len(), 3);
    }

    #[tokio::test]
    async fn test_non_failover_error_is_returned() {
        let transport = Arc::new(ScriptedTransport::new(&[("10.0.0.1:5060", 486), ("10.0.0.2:5060", 200)]));
        let manager = manager(transport.clone());
        let policy = EgressPolicy::from_config(
            "pstn",
            &static_trunk(&[("sip:10.0.0.1", 1.0), ("sip:10.0.0.2", 0.5)]),
            None,
        )
        .unwrap();

        let response = manager
            .handle_egress("pstn", &request(), &policy, policy.normalization(), &handle())
            .await
            .unwrap();
        assert_eq!(response.status, 486);
        assert_eq!(transport.sent_to(), vec!["10.0.0.1:5060"]);
    }

    #[tokio::test]
    async fn test_each_attempt_gets_a_fresh_copy() {
        let transport = Arc::new(ScriptedTransport::new(&[("10.0.0.2:5060", 503), ("10.0.0.1:5060", 200)]));
        let manager = manager(transport.clone());
        let mut config = static_trunk(&[("sip:10.0.0.1", 0.5), ("sip:10.0.0.2", 1.0)]);
        config.normalization.route_to_destination = true;
        let policy = EgressPolicy::from_config("pstn", &config, None).unwrap();
        let original = request();

        manager
            .handle_egress("pstn", &original, &policy, policy.normalization(), &handle())
            .await
            .unwrap();

        assert!(!original.headers.contains("Route"));
        let sent = transport.sent.lock().unwrap();
        for (_, outbound) in sent.iter() {
            assert_eq!(outbound.headers.get_all("Route").count(), 1);
        }
    }

    #[tokio::test]
    async fn test_stops_when_transaction_is_terminal() {
        let transport = Arc::new(ScriptedTransport::new(&[]));
        let manager = manager(transport.clone());
        let policy = EgressPolicy::from_config("pstn", &static_trunk(&[("sip:10.0.0.1", 1.0)]), None).unwrap();
        let tracker = handle();
        tracker.with(|tx| tx.time_out()).unwrap();

        let err = manager
            .handle_egress("pstn", &request(), &policy, policy.normalization(), &tracker)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(transport.sent_to().is_empty());
        assert_eq!(tracker.state(), TransactionState::TimedOut);
    }

    #[tokio::test]
    async fn test_resolve_failure_surfaces_as_resolution() {
        let manager = manager(Arc::new(ScriptedTransport::new(&[])));
        let policy = EgressPolicy::new(
            "carrier",
            DestinationSource::Resolve {
                name: "carrier.invalid".to_string(),
                transport: None,
                port: None,
            },
        );
        let err = manager
            .handle_egress("carrier", &request(), &policy, policy.normalization(), &handle())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
    }

    #[tokio::test]
    async fn test_in_dialog_uses_route_header() {
        let transport = Arc::new(ScriptedTransport::new(&[("192.0.2.10:5060", 200)]));
        let manager = manager(transport.clone());
        let bye = Request::new("BYE", SipUri::parse("sip:bob@198.51.100.1").unwrap())
            .with_header("To", "<sip:bob@example.com>;tag=a1")
            .with_header("Route", "<sip:192.0.2.10;lr>");

        let response = manager.send_in_dialog(&bye, &handle()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.sent_to(), vec!["192.0.2.10:5060"]);
        assert!(manager.balancer().tracked_destinations().await.is_empty());
    }
}
