//! Boundary message model.
//!
//! The signaling stack owns the wire grammar; it hands the proxy core these
//! already-parsed values and accepts them back for sending. Only the pieces the
//! routing engine actually reads (request line, a handful of headers, status
//! line) are modelled, the rest travels opaquely in [`Headers`] and the body.
use std::{fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while interpreting a URI handed over by the stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UriError {
    /// Scheme is neither `sip` nor `sips`
    #[error("Unsupported URI scheme in '{0}'")]
    UnsupportedScheme(String),

    /// Host part missing or malformed
    #[error("Invalid host in URI '{0}'")]
    InvalidHost(String),

    /// Port could not be parsed
    #[error("Invalid port in URI '{0}'")]
    InvalidPort(String),
}

/// URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Sip,
    Sips,
}

/// A parsed `sip:`/`sips:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    scheme: Scheme,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl SipUri {
    /// Parse a URI, tolerating the `<...>` name-addr wrapping used in `Route`
    /// and `Contact` headers.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let trimmed = input.trim();
        let inner = match (trimmed.find('<'), trimmed.find('>')) {
            (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
            _ => trimmed,
        };

        let (scheme, rest) = if let Some(rest) = strip_prefix_ignore_case(inner, "sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(inner, "sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(UriError::UnsupportedScheme(input.to_string()));
        };

        // Drop any `?headers` part, the core never reads it
        let rest = rest.split('?').next().unwrap_or_default();
        let mut segments = rest.split(';');
        let address = segments.next().unwrap_or_default();

        let (user, hostport) = match address.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, address),
        };

        let (host, port) = split_host_port(hostport, input)?;
        if host.is_empty() {
            return Err(UriError::InvalidHost(input.to_string()));
        }

        let params = segments
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.split_once('=') {
                Some((name, value)) => (name.to_ascii_lowercase(), Some(value.to_string())),
                None => (segment.to_ascii_lowercase(), None),
            })
            .collect();

        Ok(Self {
            scheme,
            user,
            host,
            port,
            params,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Host without IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Look up a URI parameter by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_deref())
    }

    /// The `transport=` parameter, if any
    pub fn transport_param(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    /// Host and optional port formatted for display (`[v6]:port`)
    pub fn host_port(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    input
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &input[prefix.len()..])
}

fn split_host_port(hostport: &str, original: &str) -> Result<(String, Option<u16>), UriError> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| UriError::InvalidHost(original.to_string()))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(
                port.parse::<u16>()
                    .map_err(|_| UriError::InvalidPort(original.to_string()))?,
            ),
            None if after.is_empty() => None,
            None => return Err(UriError::InvalidHost(original.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    match hostport.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| UriError::InvalidPort(original.to_string()))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((hostport.to_string(), None)),
    }
}

impl FromStr for SipUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SipUri::parse(s)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        };
        write!(f, "{scheme}:")?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host_port())?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{name}={value}")?,
                None => write!(f, ";{name}")?,
            }
        }
        Ok(())
    }
}

/// Ordered, case-insensitive header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for a header name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for a header name, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Append a value, keeping existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Insert a value ahead of existing ones with the same name
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let position = self
            .0
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name))
            .unwrap_or(self.0.len());
        self.0.insert(position, (name, value.into()));
    }

    /// Replace every value for the name with a single one
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Remove every value for the name, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed request handed over by the signaling stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: SipUri) -> Self {
        Self {
            method: method.into(),
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Builder-style header append, mostly useful in tests and adapters
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// A request is mid-dialog when its `To` header already carries a tag.
    pub fn is_mid_dialog(&self) -> bool {
        self.headers
            .get("To")
            .map(|to| {
                to.split(';')
                    .skip(1)
                    .any(|param| param.trim().to_ascii_lowercase().starts_with("tag="))
            })
            .unwrap_or(false)
    }

    /// Target of an established dialog: the top `Route` entry when present,
    /// otherwise the Request-URI.
    pub fn dialog_route(&self) -> Result<SipUri, UriError> {
        match self.headers.get("Route") {
            Some(route) => {
                let first = route.split(',').next().unwrap_or(route);
                SipUri::parse(first)
            }
            None => Ok(self.uri.clone()),
        }
    }
}

/// A response, either received from a destination or synthesized by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Headers copied from a request into a locally generated response
const DIALOG_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Synthesize a response to `request`, copying the transaction-identifying
    /// headers. A missing `reason` falls back to the standard phrase.
    pub fn for_request(request: &Request, status: u16, reason: Option<&str>) -> Self {
        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| default_reason(status).to_string());
        let mut response = Self::new(status, reason);
        for name in DIALOG_HEADERS {
            for value in request.headers.get_all(name) {
                response.headers.append(name, value);
            }
        }
        response
    }

    /// Leading digit of the status code (1..=6 for valid responses)
    pub fn class(&self) -> u8 {
        (self.status / 100) as u8
    }

    pub fn is_provisional(&self) -> bool {
        self.class() == 1
    }
}

/// Standard reason phrase for the status codes the core synthesizes.
pub fn default_reason(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        _ => match status / 100 {
            1 => "Provisional",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            5 => "Server Error",
            _ => "Global Failure",
        },
    }
}
