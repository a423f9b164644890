//! Record lookup backed by a static table and a DNS stub resolver.
//!
//! The static table from configuration always answers first. Names it does not
//! know are queried through `hickory-resolver`, configured from the host's
//! `resolv.conf` (falling back to the library defaults when that is missing).
use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
};

use crate::{
    config::models::StaticRecords,
    ports::dns::{LookupError, LookupResult, RecordLookup, SrvRecord},
};

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|error| {
        tracing::warn!(%error, "System resolver configuration unavailable, using defaults");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

fn is_no_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn lookup_failed(name: &str, error: ResolveError) -> LookupError {
    LookupError::Failed {
        name: name.to_string(),
        reason: error.to_string(),
    }
}

#[derive(Clone)]
pub struct SystemLookup {
    srv: HashMap<String, Vec<SrvRecord>>,
    hosts: HashMap<String, Vec<IpAddr>>,
    dns: TokioAsyncResolver,
}

impl fmt::Debug for SystemLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemLookup")
            .field("static_srv", &self.srv.len())
            .field("static_hosts", &self.hosts.len())
            .finish()
    }
}

impl SystemLookup {
    /// Build a lookup whose static table is taken from configuration.
    /// Host entries that are not IP addresses are skipped with a warning.
    pub fn from_static(records: &StaticRecords) -> Self {
        Self::with_resolver(records, system_resolver())
    }

    /// Same as [`SystemLookup::from_static`] with an explicit DNS resolver
    pub fn with_resolver(records: &StaticRecords, dns: TokioAsyncResolver) -> Self {
        let srv = records
            .srv
            .iter()
            .map(|(name, entries)| {
                let entries = entries
                    .iter()
                    .map(|r| SrvRecord {
                        priority: r.priority,
                        weight: r.weight,
                        port: r.port,
                        target: r.target.clone(),
                    })
                    .collect();
                (normalize_name(name), entries)
            })
            .collect();

        let hosts = records
            .hosts
            .iter()
            .map(|(name, addresses)| {
                let parsed = addresses
                    .iter()
                    .filter_map(|address| match address.parse::<IpAddr>() {
                        Ok(ip) => Some(ip),
                        Err(_) => {
                            tracing::warn!(host = %name, address, "Ignoring invalid static address");
                            None
                        }
                    })
                    .collect();
                (normalize_name(name), parsed)
            })
            .collect();

        Self { srv, hosts, dns }
    }
}

#[async_trait]
impl RecordLookup for SystemLookup {
    async fn lookup_srv(&self, name: &str) -> LookupResult<Vec<SrvRecord>> {
        if let Some(records) = self.srv.get(&normalize_name(name)) {
            return Ok(records.clone());
        }

        match self.dns.srv_lookup(name).await {
            Ok(answer) => Ok(answer
                .iter()
                .filter_map(|srv| {
                    let target = normalize_name(&srv.target().to_utf8());
                    // A lone "." target means the service is not offered
                    (!target.is_empty()).then(|| SrvRecord {
                        priority: srv.priority(),
                        weight: srv.weight(),
                        port: srv.port(),
                        target,
                    })
                })
                .collect()),
            Err(error) if is_no_records(&error) => {
                tracing::trace!(name, "No SRV records");
                Ok(Vec::new())
            }
            Err(error) => Err(lookup_failed(name, error)),
        }
    }

    async fn lookup_addresses(&self, host: &str, port: u16) -> LookupResult<Vec<SocketAddr>> {
        if let Some(addresses) = self.hosts.get(&normalize_name(host)) {
            return Ok(addresses.iter().map(|ip| SocketAddr::new(*ip, port)).collect());
        }

        let resolved: Vec<SocketAddr> = match self.dns.lookup_ip(host).await {
            Ok(answer) => answer.iter().map(|ip| SocketAddr::new(ip, port)).collect(),
            Err(error) if is_no_records(&error) => Vec::new(),
            Err(error) => return Err(lookup_failed(host, error)),
        };

        if resolved.is_empty() {
            return Err(LookupError::NotFound(host.to_string()));
        }
        Ok(resolved)
    }
}
