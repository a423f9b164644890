//! Destination resolution.
//!
//! Turns a target name into an ordered list of [`Destination`]s:
//! * literal IP hosts are used as-is (no lookup)
//! * an explicit port skips SRV and goes straight to address lookup
//! * otherwise SRV records for the transport are tried first, falling back to
//!   an address lookup on the transport's default port
//!
//! Every lookup is timeout-bounded and retried, and complete results are
//! cached per `(name, transport, port)` for the configured TTL. The core only
//! ever sees the final ordered list.
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::{
    config::models::ResolverConfig,
    core::{
        destination::{Destination, DestinationType, Transport},
        error::{ProxyError, ProxyResult},
        message::SipUri,
    },
    ports::dns::{LookupError, LookupResult, RecordLookup, SrvRecord},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    transport: Transport,
    port: Option<u16>,
}

#[derive(Debug, Clone)]
struct CachedDestinations {
    destinations: Vec<Destination>,
    expires_at: Instant,
}

/// Resolves target names into ordered candidate destinations
pub struct DestinationResolver {
    lookup: Arc<dyn RecordLookup>,
    supported: Vec<Transport>,
    timeout: Duration,
    attempts: u32,
    cache_ttl: Duration,
    cache: HashMap<CacheKey, CachedDestinations>,
}

impl DestinationResolver {
    pub fn new(lookup: Arc<dyn RecordLookup>, config: &ResolverConfig) -> Self {
        Self {
            lookup,
            supported: config.supported_transports.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            attempts: config.attempts.max(1),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: HashMap::new(),
        }
    }

    /// Whether `target` needs a lookup at all. Literal IP addresses (bare,
    /// bracketed, with a port, or inside a URI) do not.
    pub fn should_search(&self, target: &str) -> bool {
        literal_target(target).is_none()
    }

    /// Whether this proxy can send on `transport`
    pub fn is_supported(&self, transport: Transport) -> bool {
        self.supported.contains(&transport)
    }

    /// Resolve `name` into destinations ordered by preference (descending,
    /// ties in lookup order).
    pub async fn resolve(
        &self,
        name: &str,
        transport_hint: Option<Transport>,
        port: Option<u16>,
    ) -> ProxyResult<Vec<Destination>> {
        let transport = transport_hint.unwrap_or(Transport::Udp);
        if !self.is_supported(transport) {
            return Err(ProxyError::resolution(format!(
                "transport {transport} is not supported for {name}"
            )));
        }

        let key = CacheKey {
            name: name.to_ascii_lowercase(),
            transport,
            port,
        };

        if let Some(cached) = self.cache.get_async(&key).await.map(|e| e.get().clone()) {
            if cached.expires_at > Instant::now() {
                tracing::debug!(name, %transport, "Resolver cache hit");
                return Ok(cached.destinations);
            }
            let _ = self.cache.remove_async(&key).await;
        }

        let mut destinations = self.lookup_destinations(name, transport, port).await?;
        if destinations.is_empty() {
            return Err(ProxyError::resolution(format!("no destinations found for {name}")));
        }

        // Stable: equal preferences keep lookup order
        destinations.sort_by(|a, b| b.preference().total_cmp(&a.preference()));

        tracing::debug!(
            name,
            %transport,
            count = destinations.len(),
            "Resolved destinations"
        );

        if !self.cache_ttl.is_zero() {
            self.purge_expired().await;
            let _ = self.cache.remove_async(&key).await;
            let _ = self
                .cache
                .insert_async(
                    key,
                    CachedDestinations {
                        destinations: destinations.clone(),
                        expires_at: Instant::now() + self.cache_ttl,
                    },
                )
                .await;
        }

        Ok(destinations)
    }

    /// Same as [`Self::resolve`] but tags every produced destination with a
    /// routing/correlation token.
    pub async fn resolve_with_hint(
        &self,
        name: &str,
        transport_hint: Option<Transport>,
        port: Option<u16>,
        routing_hint: &str,
    ) -> ProxyResult<Vec<Destination>> {
        let destinations = self.resolve(name, transport_hint, port).await?;
        Ok(destinations
            .into_iter()
            .map(|destination| destination.with_routing_hint(routing_hint))
            .collect())
    }

    /// Drop every cached entry
    pub async fn clear_cache(&self) {
        self.cache.retain_async(|_, _| false).await;
    }

    /// Drop entries whose TTL has run out
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.cache.retain_async(|_, cached| cached.expires_at > now).await;
    }

    /// Number of cached results, expired ones included until purged
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    async fn lookup_destinations(
        &self,
        name: &str,
        transport: Transport,
        port: Option<u16>,
    ) -> ProxyResult<Vec<Destination>> {
        let uri = target_uri(name, transport);

        if let Some((ip, embedded_port)) = literal_target(name) {
            let port = port
                .or(embedded_port)
                .unwrap_or_else(|| transport.default_port());
            let address = SocketAddr::new(ip, port);
            return Ok(vec![build(DestinationType::A, address, transport, &uri, 1.0)?]);
        }

        if let Some(port) = port {
            return self.address_destinations(name, port, transport, &uri, 1.0, DestinationType::A).await;
        }

        let srv_name = format!("{}.{}", transport.srv_prefix(), name);
        let records = match self
            .with_retry(&srv_name, || self.lookup.lookup_srv(&srv_name))
            .await
        {
            Ok(records) => records,
            Err(LookupError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(ProxyError::resolution(e.to_string())),
        };

        if records.is_empty() {
            tracing::debug!(name, "No SRV records, falling back to address lookup");
            return self
                .address_destinations(
                    name,
                    transport.default_port(),
                    transport,
                    &uri,
                    1.0,
                    DestinationType::A,
                )
                .await;
        }

        self.srv_destinations(records, transport, &uri).await
    }

    async fn srv_destinations(
        &self,
        mut records: Vec<SrvRecord>,
        transport: Transport,
        uri: &str,
    ) -> ProxyResult<Vec<Destination>> {
        records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));

        let mut priorities: Vec<u16> = records.iter().map(|r| r.priority).collect();
        priorities.dedup();
        let levels = priorities.len() as f32;

        let mut destinations = Vec::new();
        let mut last_error = None;
        for record in &records {
            let rank = priorities
                .iter()
                .position(|p| *p == record.priority)
                .unwrap_or_default() as f32;
            let preference = 1.0 - rank / levels;
            let target = record.target.trim_end_matches('.');

            match self
                .address_destinations(target, record.port, transport, uri, preference, DestinationType::Srv)
                .await
            {
                Ok(mut resolved) => destinations.append(&mut resolved),
                Err(e) => {
                    tracing::warn!(target, error = %e, "Skipping unresolvable SRV target");
                    last_error = Some(e);
                }
            }
        }

        match (destinations.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(destinations),
        }
    }

    async fn address_destinations(
        &self,
        host: &str,
        port: u16,
        transport: Transport,
        uri: &str,
        preference: f32,
        kind: DestinationType,
    ) -> ProxyResult<Vec<Destination>> {
        let addresses = self
            .with_retry(host, || self.lookup.lookup_addresses(host, port))
            .await
            .map_err(|e| ProxyError::resolution(e.to_string()))?;

        addresses
            .into_iter()
            .map(|address| build(kind, address, transport, uri, preference))
            .collect()
    }

    /// Run a lookup with the per-attempt timeout, retrying failures and
    /// timeouts. `NotFound` is authoritative and returned immediately.
    async fn with_retry<T, F, Fut>(&self, name: &str, mut op: F) -> LookupResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LookupResult<T>>,
    {
        let mut last_error = LookupError::Failed {
            name: name.to_string(),
            reason: "no attempt made".to_string(),
        };

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e @ LookupError::NotFound(_))) => return Err(e),
                Ok(Err(e)) => {
                    tracing::debug!(name, attempt, error = %e, "Lookup failed");
                    last_error = e;
                }
                Err(_) => {
                    tracing::debug!(name, attempt, "Lookup timed out");
                    last_error = LookupError::Failed {
                        name: name.to_string(),
                        reason: format!("timed out after {:?}", self.timeout),
                    };
                }
            }
        }

        Err(last_error)
    }
}

fn build(
    kind: DestinationType,
    address: SocketAddr,
    transport: Transport,
    uri: &str,
    preference: f32,
) -> ProxyResult<Destination> {
    Destination::new(kind, address.to_string(), transport, uri, preference)
        .map_err(|e| ProxyError::internal(e.to_string()))
}

fn target_uri(name: &str, transport: Transport) -> String {
    let scheme = if transport.is_secure() { "sips" } else { "sip" };
    format!("{scheme}:{name};transport={transport}")
}

/// Literal IP address (and port, when present) of a target that needs no
/// lookup: `10.0.0.1`, `10.0.0.1:5060`, `[2001:db8::1]:5060`, `2001:db8::1`
/// or a URI with such a host.
fn literal_target(target: &str) -> Option<(IpAddr, Option<u16>)> {
    if let Ok(uri) = SipUri::parse(target) {
        return uri.host().parse::<IpAddr>().ok().map(|ip| (ip, uri.port()));
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some((ip, None));
    }
    if let Ok(address) = target.parse::<SocketAddr>() {
        return Some((address.ip(), Some(address.port())));
    }
    target
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| (ip, None))
}
