//! Default TCP connector with SRV resolution and endpoint fallback.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{error, info, warn};

use super::dns::{self, ConnectionMode, Endpoint, ServerSetting};
use super::{BoxFuture, BoxStream, Connected, Connector, TlsUpgrader};
use crate::config::Config;
use crate::error::{Error, Result};

pub struct TcpConnector {
    upgrader: Arc<dyn TlsUpgrader>,
}

impl TcpConnector {
    /// `upgrader` is used for direct-TLS endpoints.
    pub fn new(upgrader: Arc<dyn TlsUpgrader>) -> Self {
        Self { upgrader }
    }

    async fn connect_endpoint(&self, endpoint: &Endpoint, config: &Config) -> Result<Connected> {
        let mode = match endpoint.mode {
            ConnectionMode::Tcp => "tcp",
            ConnectionMode::DirectTls => "direct_tls",
        };
        let connect_started = Instant::now();
        let tcp_stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            error!(
                host = %endpoint.host, port = endpoint.port, mode,
                timeout_ms = config.connect_timeout.as_millis() as u64,
                "TCP connect timed out"
            );
            Error::Transport(format!(
                "TCP connect timed out after {}ms to {}:{}",
                config.connect_timeout.as_millis(),
                endpoint.host,
                endpoint.port
            ))
        })?
        .map_err(|e| {
            error!(
                host = %endpoint.host, port = endpoint.port, mode,
                error = %e, error_kind = ?e.kind(),
                "TCP connect failed"
            );
            Error::Transport(format!(
                "Failed to connect to XMPP server {}:{}: {}",
                endpoint.host, endpoint.port, e
            ))
        })?;
        let _ = tcp_stream.set_nodelay(true);
        info!(
            host = %endpoint.host, port = endpoint.port, mode,
            connect_ms = connect_started.elapsed().as_millis() as u64,
            "TCP connected"
        );

        // The XMPP domain, not the SRV target, is what TLS verifies
        let tls_name = endpoint.domain.clone().unwrap_or_else(|| config.domain.clone());
        match endpoint.mode {
            ConnectionMode::Tcp => Ok(Connected {
                stream: Box::new(tcp_stream),
                encrypted: false,
                tls_name,
            }),
            ConnectionMode::DirectTls => {
                let stream = self
                    .upgrader
                    .upgrade(Box::new(tcp_stream) as BoxStream, &tls_name)
                    .await?;
                Ok(Connected {
                    stream,
                    encrypted: true,
                    tls_name,
                })
            }
        }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, config: &'a Config) -> BoxFuture<'a, Result<Connected>> {
        Box::pin(async move {
            let resolve_started = Instant::now();
            let endpoints = match config.server.as_deref() {
                Some(server) => match ServerSetting::parse(server) {
                    ServerSetting::Endpoint(endpoint) => {
                        info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode,
                            domain = ?endpoint.domain, "Using explicit endpoint");
                        vec![endpoint]
                    }
                    ServerSetting::Srv(domain) => dns::resolve(&domain).await,
                },
                None => dns::resolve(&config.domain).await,
            };
            info!(
                candidates = endpoints.len(),
                dns_resolve_ms = resolve_started.elapsed().as_millis() as u64,
                "Resolved endpoints"
            );

            let mut last_error = Error::Transport(format!("No endpoint for {}", config.domain));
            for endpoint in &endpoints {
                match self.connect_endpoint(endpoint, config).await {
                    Ok(connected) => return Ok(connected),
                    Err(e) => {
                        warn!(host = %endpoint.host, port = endpoint.port, error = %e,
                            "Endpoint failed, trying next candidate");
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        })
    }
}
