//! Stream negotiation modules.
//!
//! Each module handles one step of bringing a stream up (TLS, one SASL
//! mechanism, resource binding, stream management). Modules are described in
//! a process-wide [catalogue](catalogue) and activated by category:
//!
//! | category         | modules run                         |
//! |------------------|-------------------------------------|
//! | `Security`       | first applicable one that succeeds  |
//! | `Authentication` | first applicable one that succeeds  |
//! | `Binding`        | every applicable one                |
//! | `PostAuth`       | every applicable one                |
//!
//! Within a category, higher priority goes first and ties keep registration
//! order.

pub mod catalogue;
mod bind;
mod sasl;
mod scram;
mod sm;
mod starttls;

use std::sync::Arc;

use crate::collector::Collector;
use crate::config::{Config, Credentials};
use crate::connection::attempt::{Attempt, Resumption, SessionInfo};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::framing::stream_open;
use crate::ns;
use crate::pipeline::{self, Outbound};
use crate::stanza::{Iq, Stanza};
use crate::transport::{BoxFuture, TlsUpgrader};
use crate::xml::Element;

pub use catalogue::{register_module, registered_modules};

/// Activation group, in negotiation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleCategory {
    Security,
    Authentication,
    Binding,
    /// Optional features once a resource is bound.
    PostAuth,
}

impl ModuleCategory {
    /// Only one module of an exclusive category may succeed.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, ModuleCategory::Security | ModuleCategory::Authentication)
    }
}

/// Result of one module's turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutcome {
    Success,
    /// The module found it could not be used after all; try the next one.
    NotApplicable,
    /// Fatal for the attempt.
    Failure(String),
}

pub trait NegotiationModule: Send + Sync {
    /// Whether the module applies to the current features and session.
    fn is_applicable(&self, negotiation: &Negotiation) -> bool;

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>>;
}

/// Catalogue entry.
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub category: ModuleCategory,
    pub priority: u32,
    pub factory: fn() -> Box<dyn NegotiationModule>,
}

impl std::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .finish()
    }
}

/// What a module can see and do while it negotiates.
pub struct Negotiation {
    attempt: Arc<Attempt>,
    upgrader: Arc<dyn TlsUpgrader>,
    tls_name: String,
    credentials: Option<Credentials>,
    resumption: Option<Resumption>,
}

impl Negotiation {
    pub(crate) fn new(
        attempt: Arc<Attempt>,
        upgrader: Arc<dyn TlsUpgrader>,
        tls_name: String,
        credentials: Option<Credentials>,
        resumption: Option<Resumption>,
    ) -> Self {
        Self {
            attempt,
            upgrader,
            tls_name,
            credentials,
            resumption,
        }
    }

    pub fn config(&self) -> &Config {
        &self.attempt.config
    }

    /// `None` for anonymous login.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn session(&self) -> SessionInfo {
        self.attempt.session()
    }

    pub(crate) fn update_session(&self, update: impl FnOnce(&mut SessionInfo)) {
        self.attempt.update_session(update);
    }

    pub(crate) fn resumption(&self) -> Option<&Resumption> {
        self.resumption.as_ref()
    }

    /// The child `name` of the latest features advertisement.
    pub fn feature(&self, name: &str, namespace: &str) -> Option<Element> {
        self.attempt
            .session()
            .features
            .and_then(|f| f.get_child(name, namespace).cloned())
    }

    pub fn has_feature(&self, name: &str, namespace: &str) -> bool {
        self.feature(name, namespace).is_some()
    }

    pub fn next_id(&self) -> String {
        self.attempt.ids.next_id()
    }

    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<()> {
        self.attempt.enqueue(Outbound::Stanza(stanza.into())).await
    }

    fn collector(&self, filter: Filter) -> Result<Collector> {
        self.attempt
            .collectors
            .register(filter, self.attempt.config.reply_timeout)
    }

    /// Send a stream-level element and wait for the first one matching `reply`.
    pub async fn request_nonza(&self, element: Element, reply: Filter) -> Result<Element> {
        let collector = self.collector(reply)?;
        self.send(Stanza::Nonza(element)).await?;
        match collector.await_result().await? {
            Stanza::Nonza(element) => Ok(element),
            other => Err(Error::Protocol(format!(
                "expected a stream-level element, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Send an IQ request and wait for its result or error.
    pub async fn request_iq(&self, mut iq: Iq) -> Result<Iq> {
        if iq.id.is_empty() {
            iq.id = self.next_id();
        }
        let collector = self.attempt.collectors.register_reply(
            &iq.id,
            Filter::reply_to(&iq),
            self.attempt.config.reply_timeout,
        )?;
        self.send(iq).await?;
        match collector.await_result().await? {
            Stanza::Iq(reply) => Ok(reply),
            other => Err(Error::Protocol(format!("expected an IQ, got {:?}", other.kind()))),
        }
    }

    /// Send a new stream header and wait for the features that follow it.
    pub async fn restart_stream(&self) -> Result<Element> {
        let collector = self.collector(Filter::element("features", ns::STREAMS))?;
        let config = &self.attempt.config;
        self.attempt
            .enqueue(Outbound::Raw(stream_open(&config.domain, &config.lang)))
            .await?;
        let Stanza::Nonza(features) = collector.await_result().await? else {
            return Err(Error::Protocol("stream features are not a stream element".to_string()));
        };
        self.attempt
            .update_session(|s| s.features = Some(features.clone()));
        Ok(features)
    }

    /// Wrap the transport in TLS; the stream must be restarted afterwards.
    pub async fn upgrade_transport(&self) -> Result<()> {
        pipeline::upgrade(&self.attempt, self.upgrader.as_ref(), &self.tls_name).await?;
        self.attempt.update_session(|s| s.encrypted = true);
        Ok(())
    }
}
