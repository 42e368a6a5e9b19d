//! One-way notification stanzas (`<message/>`).

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

use super::{parse_jid_attr, Extensions, StanzaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    fn parse(value: Option<&str>) -> Result<MessageType> {
        match value {
            None | Some("normal") => Ok(MessageType::Normal),
            Some("chat") => Ok(MessageType::Chat),
            Some("groupchat") => Ok(MessageType::Groupchat),
            Some("headline") => Ok(MessageType::Headline),
            Some("error") => Ok(MessageType::Error),
            Some(other) => Err(Error::Stanza(format!("unknown message type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: Option<String>,
    pub message_type: MessageType,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
    pub extensions: Extensions,
    pub error: Option<StanzaError>,
}

impl Message {
    pub fn new(to: Jid) -> Self {
        Self {
            to: Some(to),
            ..Default::default()
        }
    }

    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Chat,
            body: Some(body.into()),
            ..Self::new(to)
        }
    }

    pub(crate) fn from_element(element: &Element) -> Result<Message> {
        let mut message = Message {
            id: element.attr("id").map(str::to_string),
            message_type: MessageType::parse(element.attr("type"))?,
            from: parse_jid_attr(element, "from")?,
            to: parse_jid_attr(element, "to")?,
            ..Default::default()
        };

        for child in element.children() {
            if child.namespace() == ns::CLIENT {
                match child.name() {
                    "body" if message.body.is_none() => message.body = Some(child.text()),
                    "subject" if message.subject.is_none() => message.subject = Some(child.text()),
                    "thread" => message.thread = Some(child.text()),
                    "error" => message.error = Some(StanzaError::from_element(child)?),
                    _ => {}
                }
                continue;
            }
            message.extensions.insert(child.clone());
        }
        Ok(message)
    }

    pub(crate) fn to_element(&self) -> Element {
        let mut element = Element::new("message", ns::CLIENT)
            .with_opt_attr("id", self.id.as_deref());
        if self.message_type != MessageType::Normal {
            element.set_attr("type", self.message_type.as_str());
        }
        if let Some(to) = &self.to {
            element.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            element.set_attr("from", from.to_string());
        }
        for (name, value) in [
            ("subject", &self.subject),
            ("body", &self.body),
            ("thread", &self.thread),
        ] {
            if let Some(value) = value {
                element.append_child(Element::new(name, ns::CLIENT).with_text(value));
            }
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
