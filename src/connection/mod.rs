//! The connection handle.
//!
//! A [`Connection`] owns the state machine, the listener and extension
//! registries, and the current connection attempt. Each call to
//! [`Connection::connect`] starts a fresh attempt with its own transport,
//! pipeline tasks and outstanding collectors; the registries carry over.
//!
//! ```no_run
//! # async fn run() -> fluux_xmpp::Result<()> {
//! use fluux_xmpp::{Config, Connection, CredentialSource};
//!
//! let mut config = Config::new("example.com");
//! config.credentials = CredentialSource::Password {
//!     username: "juliet".to_string(),
//!     password: "r0m30".to_string(),
//! };
//! let connection = Connection::new(config)?;
//! connection.connect().await?;
//! connection.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod attempt;
mod state;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::collector::{CloseReason, Collector};
use crate::config::{Config, CredentialSource, SecurityMode};
use crate::error::{Error, Result};
use crate::extensions::{ExtensionManager, ExtensionRegistry};
use crate::filter::Filter;
use crate::framing::STREAM_CLOSE;
use crate::listener::{ListenerId, ListenerRegistry, StanzaListener};
use crate::module::catalogue::{activation_order, registered_modules};
use crate::module::{ModuleCategory, ModuleDescriptor, ModuleOutcome, Negotiation, NegotiationModule};
use crate::pipeline::{self, Outbound};
use crate::stanza::{IdGenerator, Iq, Presence, Stanza};
use crate::transport::{Connector, RustlsUpgrader, TcpConnector, TlsUpgrader};

use attempt::Attempt;
use state::StateMachine;

pub use attempt::SessionInfo;
pub use state::{ConnectionState, StateChange};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long `disconnect` waits for the server to close its side.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Step label plus the error that ended negotiation there.
type StepError = (&'static str, Error);

struct Inner {
    conn_id: u64,
    config: Arc<Config>,
    state: Arc<StateMachine>,
    ids: Arc<IdGenerator>,
    listeners: Arc<ListenerRegistry>,
    extensions: ExtensionRegistry,
    connector: Arc<dyn Connector>,
    upgrader: Arc<dyn TlsUpgrader>,
    credentials: Mutex<CredentialSource>,
    attempt: RwLock<Option<Arc<Attempt>>>,
    /// Serializes `connect` calls.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let attempt = self
            .attempt
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(attempt) = attempt {
            attempt.teardown(CloseReason::Closed);
        }
    }
}

/// Handle to one client connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning handle, for managers and listeners that must not keep the
/// connection alive.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.conn_id)
            .field("domain", &self.inner.config.domain)
            .field("state", &self.inner.state.current())
            .finish()
    }
}

impl Connection {
    /// Connection over TCP with SRV lookup and rustls.
    pub fn new(config: Config) -> Result<Self> {
        let upgrader: Arc<dyn TlsUpgrader> =
            Arc::new(RustlsUpgrader::new(config.dangerous_insecure_tls));
        let connector = Arc::new(TcpConnector::new(Arc::clone(&upgrader)));
        Self::with_transport(config, connector, upgrader)
    }

    /// Connection over a caller-supplied transport.
    pub fn with_transport(
        config: Config,
        connector: Arc<dyn Connector>,
        upgrader: Arc<dyn TlsUpgrader>,
    ) -> Result<Self> {
        config.validate()?;
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let credentials = config.credentials.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                conn_id,
                config: Arc::new(config),
                state: Arc::new(StateMachine::new(conn_id)),
                ids: Arc::new(IdGenerator::new()),
                listeners: Arc::new(ListenerRegistry::new()),
                extensions: ExtensionRegistry::new(),
                connector,
                upgrader,
                credentials: Mutex::new(credentials),
                attempt: RwLock::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Every transition from now on, in order.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.inner.state.subscribe()
    }

    /// The current state, updated on change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.watch()
    }

    /// What the current or latest attempt negotiated.
    pub fn session(&self) -> Option<SessionInfo> {
        self.current_attempt().map(|attempt| attempt.session())
    }

    /// A fresh stanza id.
    pub fn next_id(&self) -> String {
        self.inner.ids.next_id()
    }

    fn current_attempt(&self) -> Option<Arc<Attempt>> {
        self.inner
            .attempt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connected_attempt(&self) -> Result<Arc<Attempt>> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.current_attempt()
            .filter(|attempt| !attempt.is_torn_down())
            .ok_or(Error::NotConnected)
    }

    // Lifecycle

    /// Connect with the given credentials instead of the configured ones.
    pub async fn login(&self, credentials: CredentialSource) -> Result<()> {
        *self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = credentials;
        self.connect().await
    }

    /// Open the transport and negotiate up to `Connected`.
    ///
    /// Allowed from `Idle`, `Disconnected` and `Failed`. On error the
    /// connection is left in `Failed` (or `Disconnected` if `disconnect` was
    /// called meanwhile).
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let inner = &self.inner;
        let current = inner.state.current();
        if current != ConnectionState::Idle && !current.is_terminal() {
            return Err(Error::AlreadyConnected);
        }

        let credentials = inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve()?;
        let resumption = if inner.config.stream_management {
            self.current_attempt().and_then(|previous| previous.resumption())
        } else {
            None
        };

        if !inner.state.transition(ConnectionState::Connecting) {
            return Err(Error::AlreadyConnected);
        }
        info!(conn_id = inner.conn_id, domain = %inner.config.domain, "Connecting");

        let connected = match inner.connector.connect(&inner.config).await {
            Ok(connected) => connected,
            Err(e) => {
                inner
                    .state
                    .transition(ConnectionState::Failed(e.to_failure_reason("connect")));
                return Err(e);
            }
        };

        let (attempt, queue) = Attempt::new(
            inner.conn_id,
            Arc::clone(&inner.config),
            Arc::clone(&inner.state),
            Arc::clone(&inner.ids),
            Arc::clone(&inner.listeners),
            resumption.as_ref(),
        );
        attempt.update_session(|s| s.encrypted = connected.encrypted);
        *inner.attempt.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&attempt));
        pipeline::start(&attempt, connected.stream, queue);

        let negotiation = Negotiation::new(
            Arc::clone(&attempt),
            Arc::clone(&inner.upgrader),
            connected.tls_name,
            credentials,
            resumption,
        );
        match self.negotiate(&attempt, &negotiation).await {
            Ok(()) => {
                info!(conn_id = inner.conn_id, jid = ?attempt.session().jid, "Connected");
                Ok(())
            }
            Err((step, e)) => {
                warn!(conn_id = inner.conn_id, step, error = %e, "Negotiation failed");
                attempt.fail(e.to_failure_reason(step));
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        attempt: &Arc<Attempt>,
        negotiation: &Negotiation,
    ) -> std::result::Result<(), StepError> {
        let config = &self.inner.config;
        let advance = |to: ConnectionState, step: &'static str| {
            if self.inner.state.transition(to) {
                Ok(())
            } else {
                Err((step, interrupted(attempt)))
            }
        };

        advance(ConnectionState::StreamNegotiating, "stream")?;
        negotiation
            .restart_stream()
            .await
            .map_err(|e| ("stream", e))?;

        let modules: Vec<(ModuleDescriptor, Box<dyn NegotiationModule>)> =
            activation_order(registered_modules(), &config.disabled_modules)
                .into_iter()
                .map(|descriptor| (descriptor, (descriptor.factory)()))
                .collect();

        let security_applicable = modules.iter().any(|(descriptor, module)| {
            descriptor.category == ModuleCategory::Security && module.is_applicable(negotiation)
        });
        if security_applicable {
            advance(ConnectionState::SecurityNegotiating, "security")?;
            self.run_category(negotiation, &modules, ModuleCategory::Security)
                .await?;
        }
        if config.security == SecurityMode::Required && !negotiation.session().encrypted {
            return Err((
                "security",
                Error::Negotiation {
                    module: "security".to_string(),
                    reason: "TLS is required but could not be negotiated".to_string(),
                },
            ));
        }

        advance(ConnectionState::Authenticating, "authentication")?;
        if !self
            .run_category(negotiation, &modules, ModuleCategory::Authentication)
            .await?
        {
            return Err((
                "authentication",
                Error::Negotiation {
                    module: "authentication".to_string(),
                    reason: "no usable authentication mechanism".to_string(),
                },
            ));
        }

        advance(ConnectionState::BindingResource, "binding")?;
        self.run_category(negotiation, &modules, ModuleCategory::Binding)
            .await?;
        if negotiation.session().jid.is_none() {
            return Err((
                "binding",
                Error::Negotiation {
                    module: "binding".to_string(),
                    reason: "no resource was bound".to_string(),
                },
            ));
        }
        self.run_category(negotiation, &modules, ModuleCategory::PostAuth)
            .await?;

        advance(ConnectionState::Connected, "connected")?;
        if config.send_presence && !negotiation.session().resumed {
            attempt
                .enqueue(Outbound::Stanza(Presence::available().into()))
                .await
                .map_err(|e| ("presence", e))?;
        }
        Ok(())
    }

    /// Run the applicable modules of `category`; true if any succeeded.
    async fn run_category(
        &self,
        negotiation: &Negotiation,
        modules: &[(ModuleDescriptor, Box<dyn NegotiationModule>)],
        category: ModuleCategory,
    ) -> std::result::Result<bool, StepError> {
        let conn_id = self.inner.conn_id;
        let mut succeeded = false;
        for (descriptor, module) in modules.iter().filter(|(d, _)| d.category == category) {
            if !module.is_applicable(negotiation) {
                debug!(conn_id, module = descriptor.name, "Module not applicable");
                continue;
            }
            info!(conn_id, module = descriptor.name, "Negotiating");
            let outcome = module
                .negotiate(negotiation)
                .await
                .map_err(|e| (descriptor.name, e))?;
            match outcome {
                ModuleOutcome::Success => {
                    succeeded = true;
                    if category.is_exclusive() {
                        break;
                    }
                }
                ModuleOutcome::NotApplicable => {
                    debug!(conn_id, module = descriptor.name, "Module stepped aside");
                }
                ModuleOutcome::Failure(reason) => {
                    return Err((
                        descriptor.name,
                        Error::Negotiation {
                            module: descriptor.name.to_string(),
                            reason,
                        },
                    ));
                }
            }
        }
        Ok(succeeded)
    }

    /// Close the stream and end the attempt.
    ///
    /// Sends unavailable presence (when connected) and the stream close,
    /// waits briefly for the server's close, then tears down. Outstanding
    /// collectors fail with `ConnectionClosed`. A no-op when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let was_connected = inner.state.current() == ConnectionState::Connected;
        if !inner.state.transition(ConnectionState::Disconnecting) {
            return Ok(());
        }
        info!(conn_id = inner.conn_id, "Disconnecting");

        if let Some(attempt) = self.current_attempt().filter(|a| !a.is_torn_down()) {
            attempt.set_closing();
            if was_connected {
                let _ = attempt.try_enqueue(Outbound::Stanza(Presence::unavailable().into()));
            }
            let _ = attempt.try_enqueue(Outbound::Raw(STREAM_CLOSE.to_string()));
            if !attempt.wait_reader_done(CLOSE_GRACE).await {
                debug!(conn_id = inner.conn_id, "Server did not close the stream in time");
            }
            attempt.teardown(CloseReason::Closed);
        }
        inner.state.transition(ConnectionState::Disconnected);
        Ok(())
    }

    // Traffic

    fn prepare(&self, stanza: Stanza) -> Stanza {
        match stanza {
            Stanza::Iq(mut iq) if iq.id.is_empty() => {
                iq.id = self.next_id();
                Stanza::Iq(iq)
            }
            other => other,
        }
    }

    /// Queue a stanza, waiting for room or failing per the backpressure policy.
    pub async fn send(&self, stanza: impl Into<Stanza>) -> Result<()> {
        let attempt = self.connected_attempt()?;
        attempt
            .enqueue(Outbound::Stanza(self.prepare(stanza.into())))
            .await
    }

    /// Queue a stanza without waiting; `QueueFull` if there is no room.
    pub fn try_send(&self, stanza: impl Into<Stanza>) -> Result<()> {
        let attempt = self.connected_attempt()?;
        attempt.try_enqueue(Outbound::Stanza(self.prepare(stanza.into())))
    }

    /// Send a get/set IQ and wait for its result or error reply.
    ///
    /// An error reply is returned as `Ok` with an error outcome; only a
    /// missing reply or a lost connection is an `Err`.
    pub async fn request(&self, iq: Iq) -> Result<Iq> {
        self.request_with_timeout(iq, self.inner.config.reply_timeout)
            .await
    }

    pub async fn request_with_timeout(&self, mut iq: Iq, timeout: Duration) -> Result<Iq> {
        if !iq.is_request() {
            return Err(Error::Stanza("only get and set IQs expect a reply".to_string()));
        }
        let attempt = self.connected_attempt()?;
        if iq.id.is_empty() {
            iq.id = self.next_id();
        }
        let collector = attempt
            .collectors
            .register_reply(&iq.id, Filter::reply_to(&iq), timeout)?;
        attempt.enqueue(Outbound::Stanza(iq.into())).await?;
        match collector.await_result().await? {
            Stanza::Iq(reply) => Ok(reply),
            other => Err(Error::Protocol(format!("expected an IQ reply, got {:?}", other.kind()))),
        }
    }

    /// A collector for the next inbound stanza matching `filter`, with the
    /// configured reply timeout.
    pub fn create_collector(&self, filter: Filter) -> Result<Collector> {
        self.create_collector_with_timeout(filter, self.inner.config.reply_timeout)
    }

    pub fn create_collector_with_timeout(&self, filter: Filter, timeout: Duration) -> Result<Collector> {
        self.connected_attempt()?
            .collectors
            .register(filter, timeout)
    }

    pub fn add_listener(&self, filter: Filter, listener: impl StanzaListener) -> ListenerId {
        self.inner.listeners.add(filter, Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    // Extensions

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.inner.extensions
    }

    /// The connection's instance of `M`, created on first use.
    pub fn extension<M: ExtensionManager>(&self) -> Arc<M> {
        self.inner.extensions.get_or_create(|| M::create(self))
    }
}

/// Error for a negotiation overtaken by a teardown or a disconnect.
fn interrupted(attempt: &Attempt) -> Error {
    match attempt.close_reason() {
        Some(CloseReason::Failed(reason)) => Error::ConnectionFailed(reason),
        _ => Error::ConnectionClosed,
    }
}
