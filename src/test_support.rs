//! In-memory server side for connection tests.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::config::{Config, CredentialSource};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::framing::{extract_unit, Unit};
use crate::ns;
use crate::transport::{BoxFuture, BoxStream, Connected, Connector, TlsUpgrader};
use crate::xml::Element;

pub(crate) const PLAIN_FEATURES: &str =
    "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>";
pub(crate) const BIND_FEATURES: &str = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>";
pub(crate) const BOUND_JID: &str = "juliet@example.com/balcony";

/// Server end of one duplex transport, driven by the test.
pub(crate) struct MockServer {
    stream: DuplexStream,
    buffer: Vec<u8>,
    streams_opened: u32,
}

impl MockServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            streams_opened: 0,
        }
    }

    /// Next unit written by the client.
    pub(crate) async fn read_unit(&mut self) -> Unit {
        loop {
            if let Some((unit, used)) = extract_unit(&self.buffer).unwrap() {
                self.buffer.drain(..used);
                return unit;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed the transport");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next element written by the client.
    pub(crate) async fn read_element(&mut self) -> Element {
        match self.read_unit().await {
            Unit::Element(xml) => Element::parse(&xml).unwrap(),
            other => panic!("expected an element, got {:?}", other),
        }
    }

    /// True once the client has dropped its end.
    pub(crate) async fn read_eof(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
    }

    pub(crate) async fn send(&mut self, xml: &str) {
        self.stream.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Like `send`, for when the client may already be gone.
    pub(crate) async fn try_send(&mut self, xml: &str) -> std::io::Result<()> {
        self.stream.write_all(xml.as_bytes()).await
    }

    /// Wait for the client's stream header and answer with ours plus `features`.
    pub(crate) async fn open_stream(&mut self, features: &str) {
        match self.read_unit().await {
            Unit::StreamOpen(header) => assert!(header.contains("to='example.com'")),
            other => panic!("expected a stream header, got {:?}", other),
        }
        self.streams_opened += 1;
        let header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='stream-{}' from='example.com' version='1.0'>",
            ns::CLIENT,
            ns::STREAMS,
            self.streams_opened
        );
        self.send(&header).await;
        self.send(&format!("<stream:features>{}</stream:features>", features))
            .await;
    }

    /// Accept a PLAIN authentication.
    pub(crate) async fn accept_plain(&mut self) {
        let auth = self.read_element().await;
        assert!(auth.is("auth", ns::SASL), "expected <auth/>, got {:?}", auth);
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
    }

    /// Answer the client's bind request with [`BOUND_JID`].
    pub(crate) async fn accept_bind(&mut self) {
        let iq = self.read_element().await;
        assert_eq!(iq.name(), "iq");
        assert!(iq.has_child("bind", ns::BIND));
        let id = iq.attr("id").unwrap().to_string();
        self.send(&format!(
            "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
            id,
            ns::BIND,
            BOUND_JID
        ))
        .await;
    }

    /// Full unencrypted PLAIN login up to the bound resource.
    pub(crate) async fn serve_plain_login(&mut self) {
        self.open_stream(PLAIN_FEATURES).await;
        self.accept_plain().await;
        self.open_stream(BIND_FEATURES).await;
        self.accept_bind().await;
    }
}

/// Hands each new transport's server end to the test.
pub(crate) struct DuplexConnector {
    servers: mpsc::UnboundedSender<MockServer>,
}

impl Connector for DuplexConnector {
    fn connect<'a>(&'a self, config: &'a Config) -> BoxFuture<'a, Result<Connected>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.servers
                .send(MockServer::new(server))
                .map_err(|_| Error::Transport("test server is gone".to_string()))?;
            Ok(Connected {
                stream: Box::new(client),
                encrypted: false,
                tls_name: config.domain.clone(),
            })
        })
    }
}

/// Pretends to upgrade: the stream is returned as is.
pub(crate) struct PassthroughUpgrader;

impl TlsUpgrader for PassthroughUpgrader {
    fn upgrade<'a>(&'a self, stream: BoxStream, _server_name: &'a str) -> BoxFuture<'a, Result<BoxStream>> {
        Box::pin(async move { Ok(stream) })
    }
}

/// Config for a PLAIN login over the in-memory transport.
pub(crate) fn test_config() -> Config {
    let mut config = Config::new("example.com");
    config.credentials = CredentialSource::Password {
        username: "juliet".to_string(),
        password: "r0m30".to_string(),
    };
    config.allow_plain_without_tls = true;
    config.send_presence = false;
    config
}

/// A connection wired to in-memory transports.
pub(crate) struct Harness {
    pub(crate) connection: Connection,
    servers: mpsc::UnboundedReceiver<MockServer>,
}

impl Harness {
    pub(crate) fn new(config: Config) -> Self {
        let (tx, servers) = mpsc::unbounded_channel();
        let connection = Connection::with_transport(
            config,
            Arc::new(DuplexConnector { servers: tx }),
            Arc::new(PassthroughUpgrader),
        )
        .unwrap();
        Self { connection, servers }
    }

    /// Start `connect()` in the background; returns its handle and the server end.
    pub(crate) async fn start_connect(&mut self) -> (tokio::task::JoinHandle<Result<()>>, MockServer) {
        let connection = self.connection.clone();
        let connecting = tokio::spawn(async move { connection.connect().await });
        let server = self.servers.recv().await.unwrap();
        (connecting, server)
    }

    /// Connect through a scripted PLAIN login.
    pub(crate) async fn connect_plain(&mut self) -> MockServer {
        let (connecting, mut server) = self.start_connect().await;
        server.serve_plain_login().await;
        connecting.await.unwrap().unwrap();
        server
    }
}

/// Connected harness with the default test config.
pub(crate) async fn connected() -> (Harness, MockServer) {
    let mut harness = Harness::new(test_config());
    let server = harness.connect_plain().await;
    (harness, server)
}
