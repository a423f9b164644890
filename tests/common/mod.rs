// Shared mock ports for the integration tests
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use trunkline::{
    config::models::{DestinationConfig, ProxyConfig, TargetConfig, TrunkConfig},
    core::{
        ControllerSettings, DestinationResolver, ErrorMappingRegistry, LoadBalancer, ProxyController,
        TrunkManager,
        app_config::{MaintenanceSwitch, ProxyAppConfig, RequestHandler, ResponseInterest},
        destination::Destination,
        message::{Request, Response, SipUri},
        transaction::TransactionId,
    },
    ports::{
        dns::{LookupError, LookupResult, RecordLookup, SrvRecord},
        transport::{Transport, TransportError, TransportResult},
        upstream::UpstreamSink,
    },
};

/// Answers per destination address; unknown addresses fail to connect
pub struct ScriptedTransport {
    answers: HashMap<String, u16>,
    delay: Option<Duration>,
    panics_on: Option<String>,
    sent: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(answers: &[(&str, u16)]) -> Self {
        Self {
            answers: answers.iter().map(|(a, s)| (a.to_string(), *s)).collect(),
            delay: None,
            panics_on: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sending to `address` panics inside the transaction task
    pub fn panicking_on(mut self, address: &str) -> Self {
        self.panics_on = Some(address.to_string());
        self
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request, destination: &Destination) -> TransportResult<Response> {
        self.sent.lock().unwrap().push(destination.address().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics_on.as_deref() == Some(destination.address()) {
            panic!("transport blew up on {}", destination.address());
        }
        match self.answers.get(destination.address()) {
            Some(status) => {
                let mut response = Response::for_request(&request, *status, None);
                response.headers.append("X-Served-By", destination.address());
                Ok(response)
            }
            None => Err(TransportError::ConnectionError(destination.address().to_string())),
        }
    }

    async fn probe(&self, _destination: &Destination, _timeout: Duration) -> TransportResult<bool> {
        Ok(true)
    }
}

/// Records everything sent upstream and mirrors final responses on a channel
pub struct RecordingUpstream {
    tx: mpsc::UnboundedSender<(TransactionId, Response)>,
    responses: Mutex<Vec<(TransactionId, Response)>>,
    relayed: Mutex<Vec<Response>>,
}

impl RecordingUpstream {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(TransactionId, Response)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            tx,
            responses: Mutex::new(Vec::new()),
            relayed: Mutex::new(Vec::new()),
        });
        (upstream, rx)
    }

    pub fn responses(&self) -> Vec<(TransactionId, Response)> {
        self.responses.lock().unwrap().clone()
    }

    pub fn relayed(&self) -> Vec<Response> {
        self.relayed.lock().unwrap().clone()
    }
}

impl UpstreamSink for RecordingUpstream {
    fn respond(&self, transaction: &TransactionId, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .push((transaction.clone(), response.clone()));
        let _ = self.tx.send((transaction.clone(), response));
    }

    fn relay(&self, response: Response) {
        self.relayed.lock().unwrap().push(response);
    }
}

/// Static record table counting every query
#[derive(Default)]
pub struct CountingLookup {
    pub srv: HashMap<String, Vec<SrvRecord>>,
    pub hosts: HashMap<String, Vec<std::net::IpAddr>>,
    pub calls: AtomicUsize,
}

impl CountingLookup {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordLookup for CountingLookup {
    async fn lookup_srv(&self, name: &str) -> LookupResult<Vec<SrvRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.srv.get(name).cloned().unwrap_or_default())
    }

    async fn lookup_addresses(&self, host: &str, port: u16) -> LookupResult<Vec<SocketAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .get(host)
            .map(|ips| ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect())
            .ok_or_else(|| LookupError::NotFound(host.to_string()))
    }
}

/// Routes everything to one trunk and records notifications
pub struct TestHandler {
    trunk: Option<String>,
    pub selections: AtomicUsize,
    pub notified: Mutex<Vec<u16>>,
}

impl TestHandler {
    pub fn new(trunk: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            trunk: trunk.map(str::to_string),
            selections: AtomicUsize::new(0),
            notified: Mutex::new(Vec::new()),
        })
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    pub fn notified(&self) -> Vec<u16> {
        self.notified.lock().unwrap().clone()
    }
}

impl RequestHandler for TestHandler {
    fn select_trunk(&self, _request: &Request) -> Option<String> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        self.trunk.clone()
    }

    fn on_response(&self, _request: &Request, response: &Response) {
        self.notified.lock().unwrap().push(response.status);
    }
}

pub fn static_trunk(destinations: &[(&str, f32)]) -> TrunkConfig {
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
        normalization: Default::default(),
        error_mapping: None,
        routing_hint: None,
        network: None,
    }
}

pub fn app(handler: Arc<TestHandler>, interest: ResponseInterest) -> ProxyAppConfig {
    ProxyAppConfig::new(handler, Arc::new(MaintenanceSwitch::new(false)), true, interest, None)
}

pub fn invite(target: &str) -> Request {
    Request::new("INVITE", SipUri::parse(target).unwrap())
        .with_header("Via", "SIP/2.0/UDP 203.0.113.5;branch=z9hG4bK776asdhds")
        .with_header("From", "<sip:alice@example.com>;tag=1928301774")
        .with_header("To", "<sip:bob@example.com>")
        .with_header("Call-ID", "a84b4c76e66710@pc33.example.com")
        .with_header("CSeq", "314159 INVITE")
}

pub struct Harness {
    pub controller: Arc<ProxyController>,
    pub transport: Arc<ScriptedTransport>,
    pub upstream: Arc<RecordingUpstream>,
    pub lookup: Arc<CountingLookup>,
    pub balancer: Arc<LoadBalancer>,
    responses: mpsc::UnboundedReceiver<(TransactionId, Response)>,
}

impl Harness {
    pub fn new(config: &ProxyConfig, transport: ScriptedTransport, lookup: CountingLookup) -> Self {
        let transport = Arc::new(transport);
        let lookup = Arc::new(lookup);
        let balancer = Arc::new(LoadBalancer::new());
        let resolver = Arc::new(DestinationResolver::new(lookup.clone(), &config.resolver));
        let trunks = TrunkManager::from_config(config, resolver, balancer.clone(), transport.clone()).unwrap();
        let (upstream, responses) = RecordingUpstream::new();
        let controller = Arc::new(ProxyController::new(
            Arc::new(trunks),
            Arc::new(ErrorMappingRegistry::from_config(&config.error_mappings)),
            upstream.clone(),
            ControllerSettings::from_config(config),
        ));
        Self {
            controller,
            transport,
            upstream,
            lookup,
            balancer,
            responses,
        }
    }

    /// Live transactions left once the table drains, or after 2s
    pub async fn settled(&self) -> usize {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.controller.active_transactions() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.controller.active_transactions()
    }

    /// Next final response delivered upstream
    pub async fn next_response(&mut self) -> (TransactionId, Response) {
        tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .expect("no response delivered upstream")
            .expect("upstream channel closed")
    }
}
