//! Composable stanza predicates.
//!
//! Filters are pure: they never fail and a field the stanza does not carry is
//! simply a non-match.

use std::fmt;
use std::sync::Arc;

use crate::jid::Jid;
use crate::stanza::{Iq, IqType, Stanza, StanzaKind};

type Predicate = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Filter {
    /// Matches everything.
    All,
    /// Matches nothing.
    Nothing,
    Id(String),
    /// The unit, its IQ payload or one of its extensions is in this namespace.
    Namespace(String),
    Kind(StanzaKind),
    IqType(IqType),
    /// Top-level element name and namespace (mostly for nonzas).
    Element { name: String, namespace: String },
    /// Exact sender address.
    From(Jid),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    Custom(Predicate),
}

impl Filter {
    pub fn id(id: impl Into<String>) -> Filter {
        Filter::Id(id.into())
    }

    pub fn namespace(namespace: impl Into<String>) -> Filter {
        Filter::Namespace(namespace.into())
    }

    pub fn element(name: impl Into<String>, namespace: impl Into<String>) -> Filter {
        Filter::Element {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn custom<F>(predicate: F) -> Filter
    where
        F: Fn(&Stanza) -> bool + Send + Sync + 'static,
    {
        Filter::Custom(Arc::new(predicate))
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Result or error IQ answering `request`.
    pub fn reply_to(request: &Iq) -> Filter {
        Filter::Kind(StanzaKind::Iq)
            .and(Filter::id(request.id.as_str()))
            .and(Filter::IqType(IqType::Result).or(Filter::IqType(IqType::Error)))
    }

    pub fn matches(&self, stanza: &Stanza) -> bool {
        match self {
            Filter::All => true,
            Filter::Nothing => false,
            Filter::Id(id) => stanza.id() == Some(id.as_str()),
            Filter::Namespace(namespace) => stanza.has_namespace(namespace),
            Filter::Kind(kind) => stanza.kind() == *kind,
            Filter::IqType(iq_type) => stanza.as_iq().is_some_and(|iq| iq.iq_type == *iq_type),
            Filter::Element { name, namespace } => stanza.is_element(name, namespace),
            Filter::From(jid) => stanza.from() == Some(jid),
            Filter::And(a, b) => a.matches(stanza) && b.matches(stanza),
            Filter::Or(a, b) => a.matches(stanza) || b.matches(stanza),
            Filter::Not(inner) => !inner.matches(stanza),
            Filter::Custom(predicate) => predicate(stanza),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => write!(f, "All"),
            Filter::Nothing => write!(f, "Nothing"),
            Filter::Id(id) => write!(f, "Id({})", id),
            Filter::Namespace(ns) => write!(f, "Namespace({})", ns),
            Filter::Kind(kind) => write!(f, "Kind({:?})", kind),
            Filter::IqType(t) => write!(f, "IqType({:?})", t),
            Filter::Element { name, namespace } => write!(f, "Element({} {})", name, namespace),
            Filter::From(jid) => write!(f, "From({})", jid),
            Filter::And(a, b) => write!(f, "And({:?}, {:?})", a, b),
            Filter::Or(a, b) => write!(f, "Or({:?}, {:?})", a, b),
            Filter::Not(inner) => write!(f, "Not({:?})", inner),
            Filter::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;
    use crate::stanza::{Message, Presence};
    use crate::xml::Element;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn iq_result(id: &str) -> Stanza {
        Stanza::from_element(Element::parse(&format!("<iq type='result' id='{}'/>", id)).unwrap())
            .unwrap()
    }

    #[test]
    fn test_id_filter() {
        assert!(Filter::id("q1").matches(&iq_result("q1")));
        assert!(!Filter::id("q1").matches(&iq_result("q2")));
        // Presence without an id never matches an id filter
        assert!(!Filter::id("q1").matches(&<Stanza as From<_>>::from(Presence::available())));
    }

    #[test]
    fn test_kind_and_type_filters() {
        let presence = <Stanza as From<_>>::from(Presence::available());
        assert!(Filter::Kind(StanzaKind::Presence).matches(&presence));
        assert!(!Filter::IqType(IqType::Result).matches(&presence));
        assert!(Filter::IqType(IqType::Result).matches(&iq_result("x")));
    }

    #[test]
    fn test_element_filter_on_nonza_and_stanza() {
        let success = <Stanza as From<_>>::from(Element::new("success", ns::SASL));
        assert!(Filter::element("success", ns::SASL).matches(&success));
        assert!(!Filter::element("failure", ns::SASL).matches(&success));
        assert!(Filter::element("iq", ns::CLIENT).matches(&iq_result("x")));
    }

    #[test]
    fn test_from_filter_missing_sender() {
        let jid: Jid = "example.com".parse().unwrap();
        assert!(!Filter::From(jid).matches(&iq_result("x")));
    }

    #[test]
    fn test_reply_to_matches_result_and_error_only() {
        let request = Iq::get(Element::new("ping", ns::PING)).with_id("q1");
        let filter = Filter::reply_to(&request);
        assert!(filter.matches(&iq_result("q1")));
        assert!(!filter.matches(&<Stanza as From<_>>::from(request.clone())));
        let error = <Stanza as From<_>>::from(request.error_reply(crate::stanza::StanzaError::service_unavailable()));
        assert!(filter.matches(&error));
    }

    #[test]
    fn test_combinators_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let counting = Filter::custom(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let stanza = <Stanza as From<_>>::from(Message::default());

        assert!(!Filter::Nothing.and(counting.clone()).matches(&stanza));
        assert!(Filter::All.or(counting.clone()).matches(&stanza));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(Filter::All.and(counting.clone()).matches(&stanza));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!counting.negate().matches(&stanza));
    }
}
