//! Presence broadcast stanzas.

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

use super::{parse_jid_attr, Extensions, StanzaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    /// Wire value; `None` for plain availability.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }

    fn parse(value: Option<&str>) -> Result<PresenceType> {
        match value {
            None => Ok(PresenceType::Available),
            Some("unavailable") => Ok(PresenceType::Unavailable),
            Some("subscribe") => Ok(PresenceType::Subscribe),
            Some("subscribed") => Ok(PresenceType::Subscribed),
            Some("unsubscribe") => Ok(PresenceType::Unsubscribe),
            Some("unsubscribed") => Ok(PresenceType::Unsubscribed),
            Some("probe") => Ok(PresenceType::Probe),
            Some("error") => Ok(PresenceType::Error),
            Some(other) => Err(Error::Stanza(format!("unknown presence type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Show::Away => "away",
            Show::Chat => "chat",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }

    fn parse(value: &str) -> Option<Show> {
        match value {
            "away" => Some(Show::Away),
            "chat" => Some(Show::Chat),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    pub id: Option<String>,
    pub presence_type: PresenceType,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub priority: i8,
    pub extensions: Extensions,
    pub error: Option<StanzaError>,
}

impl Presence {
    pub fn available() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            presence_type: PresenceType::Unavailable,
            ..Default::default()
        }
    }

    pub(crate) fn from_element(element: &Element) -> Result<Presence> {
        let mut presence = Presence {
            id: element.attr("id").map(str::to_string),
            presence_type: PresenceType::parse(element.attr("type"))?,
            from: parse_jid_attr(element, "from")?,
            to: parse_jid_attr(element, "to")?,
            ..Default::default()
        };

        for child in element.children() {
            if child.namespace() == ns::CLIENT {
                match child.name() {
                    // Unknown show values are ignored rather than rejected
                    "show" => presence.show = Show::parse(child.text().trim()),
                    "status" if presence.status.is_none() => presence.status = Some(child.text()),
                    "priority" => {
                        presence.priority = child.text().trim().parse().map_err(|_| {
                            Error::Stanza(format!("invalid presence priority '{}'", child.text()))
                        })?;
                    }
                    "error" => presence.error = Some(StanzaError::from_element(child)?),
                    _ => {}
                }
                continue;
            }
            presence.extensions.insert(child.clone());
        }
        Ok(presence)
    }

    pub(crate) fn to_element(&self) -> Element {
        let mut element = Element::new("presence", ns::CLIENT)
            .with_opt_attr("id", self.id.as_deref())
            .with_opt_attr("type", self.presence_type.as_str());
        if let Some(to) = &self.to {
            element.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            element.set_attr("from", from.to_string());
        }
        if let Some(show) = self.show {
            element.append_child(Element::new("show", ns::CLIENT).with_text(show.as_str()));
        }
        if let Some(status) = &self.status {
            element.append_child(Element::new("status", ns::CLIENT).with_text(status));
        }
        if self.priority != 0 {
            element.append_child(
                Element::new("priority", ns::CLIENT).with_text(&self.priority.to_string()),
            );
        }
        for extension in self.extensions.iter() {
            element.append_child(extension.clone());
        }
        if let Some(error) = &self.error {
            element.append_child(error.to_element());
        }
        element
    }
}
