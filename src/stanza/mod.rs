//! Protocol units exchanged over the stream.
//!
//! Inbound elements are converted into a [`Stanza`] once by the reader loop;
//! from then on they are shared immutably with collectors and listeners.

mod extension;
mod iq;
mod message;
mod presence;

use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

pub use extension::{ExtensionElement, Extensions};
pub use iq::{Iq, IqOutcome, IqType};
pub use message::{Message, MessageType};
pub use presence::{Presence, PresenceType, Show};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Iq(Iq),
    Message(Message),
    Presence(Presence),
    /// Stream-level element (features, SASL, TLS, stream management).
    Nonza(Element),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
    Nonza,
}

impl Stanza {
    /// Classify a parsed top-level element.
    pub fn from_element(element: Element) -> Result<Stanza> {
        if element.namespace() != ns::CLIENT {
            return Ok(Stanza::Nonza(element));
        }
        match element.name() {
            "iq" => Ok(Stanza::Iq(Iq::from_element(&element)?)),
            "message" => Ok(Stanza::Message(Message::from_element(&element)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(&element)?)),
            other => Err(Error::Stanza(format!("unknown stanza <{}/>", other))),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Iq(iq) => iq.to_element(),
            Stanza::Message(message) => message.to_element(),
            Stanza::Presence(presence) => presence.to_element(),
            Stanza::Nonza(element) => element.clone(),
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Iq(_) => StanzaKind::Iq,
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::Presence(_) => StanzaKind::Presence,
            Stanza::Nonza(_) => StanzaKind::Nonza,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => Some(iq.id.as_str()).filter(|id| !id.is_empty()),
            Stanza::Message(message) => message.id.as_deref(),
            Stanza::Presence(presence) => presence.id.as_deref(),
            Stanza::Nonza(element) => element.attr("id"),
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.from.as_ref(),
            Stanza::Message(message) => message.from.as_ref(),
            Stanza::Presence(presence) => presence.from.as_ref(),
            Stanza::Nonza(_) => None,
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Iq(iq) => iq.to.as_ref(),
            Stanza::Message(message) => message.to.as_ref(),
            Stanza::Presence(presence) => presence.to.as_ref(),
            Stanza::Nonza(_) => None,
        }
    }

    /// True if the unit itself, its IQ payload or one of its extensions lives in `namespace`.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        match self {
            Stanza::Iq(iq) => iq.payload_namespace() == Some(namespace),
            Stanza::Message(message) => message.extensions.has_namespace(namespace),
            Stanza::Presence(presence) => presence.extensions.has_namespace(namespace),
            Stanza::Nonza(element) => element.namespace() == namespace,
        }
    }

    /// Top-level element name and namespace test.
    pub fn is_element(&self, name: &str, namespace: &str) -> bool {
        let stanza_name = match self {
            Stanza::Iq(_) => "iq",
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Nonza(element) => return element.is(name, namespace),
        };
        stanza_name == name && namespace == ns::CLIENT
    }

    pub fn as_iq(&self) -> Option<&Iq> {
        match self {
            Stanza::Iq(iq) => Some(iq),
            _ => None,
        }
    }

    pub fn as_nonza(&self) -> Option<&Element> {
        match self {
            Stanza::Nonza(element) => Some(element),
            _ => None,
        }
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Stanza::Nonza(element)
    }
}

pub(crate) fn parse_jid_attr(element: &Element, key: &str) -> Result<Option<Jid>> {
    element.attr(key).map(str::parse::<Jid>).transpose()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Auth => "auth",
            ErrorType::Cancel => "cancel",
            ErrorType::Continue => "continue",
            ErrorType::Modify => "modify",
            ErrorType::Wait => "wait",
        }
    }
}

/// `<error/>` child of an error-typed stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    pub error_type: ErrorType,
    /// Defined condition element name, e.g. `item-not-found`.
    pub condition: String,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(error_type: ErrorType, condition: impl Into<String>) -> Self {
        Self {
            error_type,
            condition: condition.into(),
            text: None,
        }
    }

    pub fn service_unavailable() -> Self {
        Self::new(ErrorType::Cancel, "service-unavailable")
    }

    pub fn feature_not_implemented() -> Self {
        Self::new(ErrorType::Cancel, "feature-not-implemented")
    }

    pub fn from_element(element: &Element) -> Result<StanzaError> {
        let error_type = match element.attr("type") {
            Some("auth") => ErrorType::Auth,
            Some("cancel") => ErrorType::Cancel,
            Some("continue") => ErrorType::Continue,
            Some("modify") => ErrorType::Modify,
            Some("wait") => ErrorType::Wait,
            Some(other) => return Err(Error::Stanza(format!("unknown error type '{}'", other))),
            None => return Err(Error::Stanza("stanza error without type".to_string())),
        };
        let mut condition = None;
        let mut text = None;
        for child in element.children().filter(|c| c.namespace() == ns::STANZA_ERRORS) {
            if child.name() == "text" {
                text = Some(child.text());
            } else if condition.is_none() {
                condition = Some(child.name().to_string());
            }
        }
        Ok(StanzaError {
            error_type,
            condition: condition.unwrap_or_else(|| "undefined-condition".to_string()),
            text,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("error", ns::CLIENT)
            .with_attr("type", self.error_type.as_str())
            .with_child(Element::new(self.condition.as_str(), ns::STANZA_ERRORS));
        if let Some(text) = &self.text {
            element.append_child(Element::new("text", ns::STANZA_ERRORS).with_text(text));
        }
        element
    }
}

/// Per-connection stanza id source: a random prefix plus a counter.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        let prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect();
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
