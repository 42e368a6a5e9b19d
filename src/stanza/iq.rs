//! Request/response stanzas (`<iq/>`).

use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

use super::{parse_jid_attr, StanzaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<IqType> {
        match value {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(Error::Stanza(format!("unknown iq type '{}'", other))),
        }
    }
}

/// Outcome tag of a request/response unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqOutcome {
    /// A request still waiting for its reply.
    Pending,
    Result,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
    /// Empty until the connection assigns one at send time.
    pub id: String,
    pub iq_type: IqType,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub payload: Option<Element>,
    pub error: Option<StanzaError>,
}

impl Iq {
    fn new(iq_type: IqType, payload: Option<Element>) -> Self {
        Self {
            id: String::new(),
            iq_type,
            from: None,
            to: None,
            payload,
            error: None,
        }
    }

    pub fn get(payload: Element) -> Self {
        Self::new(IqType::Get, Some(payload))
    }

    pub fn set(payload: Element) -> Self {
        Self::new(IqType::Set, Some(payload))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn outcome(&self) -> IqOutcome {
        match self.iq_type {
            IqType::Get | IqType::Set => IqOutcome::Pending,
            IqType::Result => IqOutcome::Result,
            IqType::Error => IqOutcome::Error,
        }
    }

    pub fn is_request(&self) -> bool {
        self.outcome() == IqOutcome::Pending
    }

    /// Namespace of the payload, if any.
    pub fn payload_namespace(&self) -> Option<&str> {
        self.payload.as_ref().map(Element::namespace)
    }

    /// A `result` answering this request, addressed back to its sender.
    pub fn result_reply(&self, payload: Option<Element>) -> Iq {
        Iq {
            id: self.id.clone(),
            iq_type: IqType::Result,
            from: None,
            to: self.from.clone(),
            payload,
            error: None,
        }
    }

    /// An `error` answering this request. The original payload is echoed back.
    pub fn error_reply(&self, error: StanzaError) -> Iq {
        Iq {
            id: self.id.clone(),
            iq_type: IqType::Error,
            from: None,
            to: self.from.clone(),
            payload: self.payload.clone(),
            error: Some(error),
        }
    }

    pub(crate) fn from_element(element: &Element) -> Result<Iq> {
        let id = element
            .attr("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Stanza("iq without id".to_string()))?
            .to_string();
        let iq_type = IqType::parse(
            element
                .attr("type")
                .ok_or_else(|| Error::Stanza(format!("iq '{}' without type", id)))?,
        )?;

        let mut payload = None;
        let mut error = None;
        for child in element.children() {
            if iq_type == IqType::Error && child.is("error", ns::CLIENT) {
                error = Some(StanzaError::from_element(child)?);
            } else if payload.is_none() {
                payload = Some(child.clone());
            }
        }
        if iq_type == IqType::Error && error.is_none() {
            return Err(Error::Stanza(format!("error iq '{}' without <error/>", id)));
        }

        Ok(Iq {
            id,
            iq_type,
            from: parse_jid_attr(element, "from")?,
            to: parse_jid_attr(element, "to")?,
            payload,
            error,
        })
    }

    pub(crate) fn to_element(&self) -> Element {
        let mut element = Element::new("iq", ns::CLIENT)
            .with_attr("type", self.iq_type.as_str())
            .with_attr("id", self.id.as_str());
        if let Some(to) = &self.to {
            element.set_attr("to", to.to_string());
        }
        if let Some(from) = &self.from {
            element.set_attr("from", from.to_string());
        }
        if let Some(payload) = &self.payload {
            element.append_child(payload.clone());
        }
        if let Some(error) = &self.error {
            element.append_child(error.to_element());
        }
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::ErrorType;

    #[test]
    fn test_parse_result_with_payload() {
        let el = Element::parse(
            "<iq type='result' id='bind_1' from='example.com'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@example.com/r</jid></bind></iq>",
        )
        .unwrap();
        let iq = Iq::from_element(&el).unwrap();
        assert_eq!(iq.id, "bind_1");
        assert_eq!(iq.outcome(), IqOutcome::Result);
        assert_eq!(iq.payload_namespace(), Some(ns::BIND));
        assert_eq!(iq.from.unwrap().to_string(), "example.com");
    }

    #[test]
    fn test_parse_error_reply() {
        let el = Element::parse(
            "<iq type='error' id='q1'><ping xmlns='urn:xmpp:ping'/><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        )
        .unwrap();
        let iq = Iq::from_element(&el).unwrap();
        assert_eq!(iq.outcome(), IqOutcome::Error);
        let error = iq.error.unwrap();
        assert_eq!(error.error_type, ErrorType::Cancel);
        assert_eq!(error.condition, "service-unavailable");
        assert_eq!(iq.payload.unwrap().namespace(), ns::PING);
    }

    #[test]
    fn test_parse_rejects_missing_id_or_type() {
        let no_id = Element::parse("<iq type='get'/>").unwrap();
        assert!(Iq::from_element(&no_id).is_err());
        let bad_type = Element::parse("<iq id='x' type='fetch'/>").unwrap();
        assert!(Iq::from_element(&bad_type).is_err());
    }

    #[test]
    fn test_replies_swap_addressing() {
        let mut request = Iq::get(Element::new("ping", ns::PING)).with_id("p-1");
        request.from = Some("juliet@capulet.lit/balcony".parse().unwrap());

        let result = request.result_reply(None);
        assert_eq!(result.id, "p-1");
        assert_eq!(result.iq_type, IqType::Result);
        assert_eq!(result.to, request.from);
        assert_eq!(
            result.to_element().to_xml(),
            "<iq type='result' id='p-1' to='juliet@capulet.lit/balcony'/>"
        );

        let error = request.error_reply(StanzaError::service_unavailable());
        assert_eq!(error.outcome(), IqOutcome::Error);
        let reparsed = Iq::from_element(&Element::parse(&error.to_element().to_xml()).unwrap()).unwrap();
        assert_eq!(reparsed.error.unwrap().condition, "service-unavailable");
    }
}
