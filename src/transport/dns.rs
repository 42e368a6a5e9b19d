//! Where to connect: the `server` setting and DNS SRV lookup (RFC 6120 §3.2).
//!
//! Candidates come back in attempt order. Direct TLS records (XEP-0368) are
//! tried before STARTTLS ones, and a bare `domain:5222` is the last resort
//! when the domain publishes no SRV records at all.

use std::time::Instant;

use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

pub const STARTTLS_PORT: u16 = 5222;
pub const DIRECT_TLS_PORT: u16 = 5223;

/// How the socket becomes encrypted, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP; may upgrade via STARTTLS.
    Tcp,
    /// TLS from the first byte.
    DirectTls,
}

/// One candidate server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain when `host` is only a delegated target; TLS verifies the
    /// domain, not the target (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl Endpoint {
    /// Name for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

/// The `server` setting, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSetting {
    /// Connect here and nowhere else.
    Endpoint(Endpoint),
    /// Look the domain up through SRV.
    Srv(String),
}

const SCHEMES: [(&str, ConnectionMode, u16); 2] = [
    ("tls://", ConnectionMode::DirectTls, DIRECT_TLS_PORT),
    ("tcp://", ConnectionMode::Tcp, STARTTLS_PORT),
];

/// `host:port` with a numeric port. The last colon wins and brackets are
/// stripped, so `[2001:db8::1]:5222` works.
fn split_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

impl ServerSetting {
    /// Accepted forms:
    ///
    /// | input                             | result                            |
    /// |-----------------------------------|-----------------------------------|
    /// | `tls://host[:port][?domain=d]`    | direct TLS, port 5223 by default  |
    /// | `tcp://host[:port][?domain=d]`    | TCP + STARTTLS, port 5222 by default |
    /// | `host:port`                       | TLS if the port is 5223, else TCP |
    /// | `domain`                          | SRV lookup                        |
    pub fn parse(input: &str) -> ServerSetting {
        let input = input.trim();
        for (scheme, mode, default_port) in SCHEMES {
            let Some(rest) = input.strip_prefix(scheme) else {
                continue;
            };
            let (address, query) = rest.split_once('?').unwrap_or((rest, ""));
            let domain = query
                .split('&')
                .find_map(|param| param.strip_prefix("domain="))
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            let (host, port) = split_port(address).unwrap_or((address, default_port));
            return ServerSetting::Endpoint(Endpoint {
                host: host.to_string(),
                port,
                mode,
                domain,
            });
        }

        match split_port(input) {
            Some((host, port)) => ServerSetting::Endpoint(Endpoint {
                host: host.to_string(),
                port,
                mode: if port == DIRECT_TLS_PORT {
                    ConnectionMode::DirectTls
                } else {
                    ConnectionMode::Tcp
                },
                domain: None,
            }),
            None => ServerSetting::Srv(input.to_string()),
        }
    }
}

/// One SRV answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvTarget {
    priority: u16,
    weight: u16,
    host: String,
    port: u16,
}

/// Lowest priority first, heavier weight first within a priority. A `.`
/// target means the service is deliberately not offered.
fn srv_endpoints(domain: &str, mode: ConnectionMode, mut targets: Vec<SrvTarget>) -> Vec<Endpoint> {
    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    targets
        .into_iter()
        .filter(|t| !t.host.is_empty())
        .map(|t| Endpoint {
            host: t.host,
            port: t.port,
            mode,
            domain: Some(domain.to_string()),
        })
        .collect()
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        warn!(error = %e, "No usable system DNS config, using the default resolver");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

async fn lookup(resolver: &TokioAsyncResolver, domain: &str, service: &str, mode: ConnectionMode) -> Vec<Endpoint> {
    let name = format!("{}._tcp.{}", service, domain);
    let started = Instant::now();
    match resolver.srv_lookup(name.as_str()).await {
        Ok(answer) => {
            let targets = answer
                .iter()
                .map(|r| SrvTarget {
                    priority: r.priority(),
                    weight: r.weight(),
                    host: r.target().to_string().trim_end_matches('.').to_string(),
                    port: r.port(),
                })
                .collect();
            let endpoints = srv_endpoints(domain, mode, targets);
            debug!(
                srv = %name,
                count = endpoints.len(),
                lookup_ms = started.elapsed().as_millis() as u64,
                "SRV answer"
            );
            endpoints
        }
        Err(e) => {
            debug!(
                srv = %name,
                lookup_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "No SRV answer"
            );
            Vec::new()
        }
    }
}

/// Candidate endpoints for `domain`, in attempt order.
pub async fn resolve(domain: &str) -> Vec<Endpoint> {
    let started = Instant::now();
    let resolver = system_resolver();
    let mut endpoints = lookup(&resolver, domain, "_xmpps-client", ConnectionMode::DirectTls).await;
    endpoints.extend(lookup(&resolver, domain, "_xmpp-client", ConnectionMode::Tcp).await);

    if endpoints.is_empty() {
        warn!(domain, port = STARTTLS_PORT, "No SRV records, connecting to the domain itself");
        endpoints.push(Endpoint {
            host: domain.to_string(),
            port: STARTTLS_PORT,
            mode: ConnectionMode::Tcp,
            domain: None,
        });
    } else {
        info!(
            domain,
            candidates = endpoints.len(),
            resolve_ms = started.elapsed().as_millis() as u64,
            "SRV resolution complete"
        );
    }
    endpoints
}
