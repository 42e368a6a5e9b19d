//! Client-side XMPP connection engine.
//!
//! [`Connection`] drives a stream from transport setup through STARTTLS,
//! SASL and resource binding to `Connected`, then runs the reader, writer
//! and listener dispatch tasks. Requests are correlated with their replies
//! through [`Collector`]s; standing registrations are [`StanzaListener`]s.
//! Negotiation steps are pluggable [`module`]s kept in a process-wide
//! catalogue.

pub mod collector;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod filter;
pub mod framing;
pub mod jid;
pub mod listener;
pub mod logging;
pub mod module;
pub mod ns;
mod pipeline;
pub mod stanza;
pub mod transport;
pub mod xml;

#[cfg(test)]
mod test_support;

pub use collector::{Collector, CollectorCanceller};
pub use config::{Config, CredentialSource, Credentials};
pub use connection::{Connection, ConnectionState, SessionInfo, StateChange, WeakConnection};
pub use error::{Error, FailureReason, Result};
pub use extensions::ExtensionManager;
pub use filter::Filter;
pub use jid::Jid;
pub use listener::{ListenerId, StanzaListener};
pub use stanza::{Iq, IqType, Message, Presence, Stanza, StanzaError};
pub use xml::Element;
