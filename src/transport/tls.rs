//! TLS client setup over rustls.

use std::sync::{Arc, Once};

use tokio::sync::OnceCell;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::{BoxFuture, BoxStream, TlsUpgrader};
use crate::error::{Error, Result};

fn install_ring_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate chain. Handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Roots from the operating system store. Individual unparseable
/// certificates are skipped; an empty result is an error.
fn native_roots() -> Result<RootCertStore> {
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        warn!(error = %e, "Problem reading system certificates");
    }
    let mut roots = RootCertStore::empty();
    let (added, skipped) = roots.add_parsable_certificates(loaded.certs);
    debug!(added, skipped, "Loaded system root certificates");
    if roots.is_empty() {
        return Err(Error::Transport(
            "no usable system root certificates (is a CA bundle installed?)".to_string(),
        ));
    }
    Ok(roots)
}

fn client_config(insecure: bool) -> Result<ClientConfig> {
    install_ring_provider();
    if insecure {
        warn!("TLS certificate verification is disabled (dangerous_insecure_tls)");
        let verifier = AcceptAnyCert(Arc::new(crypto::ring::default_provider()));
        return Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth());
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(native_roots()?)
        .with_no_client_auth())
}

/// Short tag for handshake failures in logs.
fn failure_kind(detail: &str) -> &'static str {
    let detail = detail.to_ascii_lowercase();
    if detail.contains("certificate") {
        "certificate"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") || detail.contains("eof") {
        "peer_closed"
    } else {
        "other"
    }
}

/// Default upgrader: a rustls handshake using the server name for SNI and
/// verification. The client config is built on first use and then shared by
/// every upgrade through this upgrader.
#[derive(Default)]
pub struct RustlsUpgrader {
    insecure: bool,
    connector: OnceCell<TlsConnector>,
}

impl std::fmt::Debug for RustlsUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsUpgrader")
            .field("insecure", &self.insecure)
            .field("ready", &self.connector.initialized())
            .finish()
    }
}

impl RustlsUpgrader {
    pub fn new(insecure: bool) -> Self {
        Self {
            insecure,
            connector: OnceCell::new(),
        }
    }

    async fn connector(&self) -> Result<&TlsConnector> {
        self.connector
            .get_or_try_init(|| async {
                client_config(self.insecure).map(|config| TlsConnector::from(Arc::new(config)))
            })
            .await
    }
}

impl TlsUpgrader for RustlsUpgrader {
    fn upgrade<'a>(&'a self, stream: BoxStream, server_name: &'a str) -> BoxFuture<'a, Result<BoxStream>> {
        Box::pin(async move {
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| Error::Transport(format!("invalid TLS server name {:?}: {}", server_name, e)))?;
            let connector = self.connector().await?;
            match connector.connect(name, stream).await {
                Ok(tls) => {
                    info!(server_name, "TLS handshake complete");
                    Ok(Box::new(tls) as BoxStream)
                }
                Err(e) => {
                    let kind = failure_kind(&e.to_string());
                    error!(server_name, error = %e, kind, "TLS handshake failed");
                    Err(Error::Transport(format!("TLS handshake with {} failed: {}", server_name, e)))
                }
            }
        })
    }
}
