//! Transport boundary: how a byte stream to the server is obtained and
//! upgraded to TLS.
//!
//! The engine only ever sees a [`BoxStream`]; the pipeline splits it into a
//! read half and a write half and puts them back together for an upgrade.

pub mod dns;
pub mod tcp;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Config;
use crate::error::Result;

pub use tcp::TcpConnector;
pub use tls::RustlsUpgrader;

pub use futures_util::future::BoxFuture;

/// Bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxStream = Box<dyn AsyncStream>;

/// An established transport.
pub struct Connected {
    pub stream: BoxStream,
    /// True if TLS is already in place (direct TLS endpoints).
    pub encrypted: bool,
    /// Name to verify when upgrading later via STARTTLS.
    pub tls_name: String,
}

/// Opens the transport for one connection attempt.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, config: &'a Config) -> BoxFuture<'a, Result<Connected>>;
}

/// Wraps an established stream in TLS.
pub trait TlsUpgrader: Send + Sync {
    fn upgrade<'a>(&'a self, stream: BoxStream, server_name: &'a str) -> BoxFuture<'a, Result<BoxStream>>;
}
