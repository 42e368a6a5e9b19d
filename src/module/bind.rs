use tracing::info;

use super::{ModuleOutcome, Negotiation, NegotiationModule};
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqOutcome};
use crate::transport::BoxFuture;
use crate::xml::Element;

pub(super) const RESOURCE_BIND: &str = "resource-bind";
pub(super) const LEGACY_SESSION: &str = "legacy-session";

pub(super) fn create_resource_bind() -> Box<dyn NegotiationModule> {
    Box::new(ResourceBind)
}

pub(super) fn create_legacy_session() -> Box<dyn NegotiationModule> {
    Box::new(LegacySession)
}

fn error_condition(iq: &Iq) -> String {
    iq.error
        .as_ref()
        .map(|e| e.condition.clone())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

/// RFC 6120 resource binding.
struct ResourceBind;

impl NegotiationModule for ResourceBind {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        let session = negotiation.session();
        !session.resumed && session.jid.is_none() && negotiation.has_feature("bind", ns::BIND)
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            let mut bind = Element::new("bind", ns::BIND);
            if let Some(resource) = &negotiation.config().resource {
                bind.append_child(Element::new("resource", ns::BIND).with_text(resource));
            }
            let reply = negotiation.request_iq(Iq::set(bind)).await?;
            if reply.outcome() == IqOutcome::Error {
                return Ok(ModuleOutcome::Failure(format!(
                    "resource binding refused: {}",
                    error_condition(&reply)
                )));
            }

            let jid: Jid = reply
                .payload
                .as_ref()
                .and_then(|p| p.get_child("jid", ns::BIND))
                .map(Element::text)
                .ok_or_else(|| Error::Protocol("bind result without jid".to_string()))?
                .trim()
                .parse()
                .map_err(|_| Error::Protocol("bind result with invalid jid".to_string()))?;
            info!(jid = %jid, "Resource bound");
            negotiation.update_session(|s| s.jid = Some(jid));
            Ok(ModuleOutcome::Success)
        })
    }
}

/// RFC 3921 session establishment, for servers that still require it.
struct LegacySession;

impl NegotiationModule for LegacySession {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        !negotiation.session().resumed
            && negotiation
                .feature("session", ns::SESSION)
                .is_some_and(|session| !session.has_child("optional", ns::SESSION))
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            let reply = negotiation
                .request_iq(Iq::set(Element::new("session", ns::SESSION)))
                .await?;
            match reply.outcome() {
                IqOutcome::Error => Ok(ModuleOutcome::Failure(format!(
                    "session establishment refused: {}",
                    error_condition(&reply)
                ))),
                _ => Ok(ModuleOutcome::Success),
            }
        })
    }
}
