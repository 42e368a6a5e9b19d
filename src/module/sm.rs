//! XEP-0198 stream management: enabling it and resuming a previous session.
//!
//! The modules only send the requests and read the verdict. The reader keeps
//! the counters (`<enabled/>`, `<resumed/>`, `<r/>`, `<a/>`).

use tracing::{info, warn};

use super::{ModuleOutcome, Negotiation, NegotiationModule};
use crate::error::Result;
use crate::filter::Filter;
use crate::ns;
use crate::transport::BoxFuture;
use crate::xml::Element;

pub(super) const RESUME: &str = "sm-resume";
pub(super) const ENABLE: &str = "sm-enable";

pub(super) fn create_resume() -> Box<dyn NegotiationModule> {
    Box::new(Resume)
}

pub(super) fn create_enable() -> Box<dyn NegotiationModule> {
    Box::new(Enable)
}

fn verdict(name: &str) -> Filter {
    Filter::element(name, ns::SM).or(Filter::element("failed", ns::SM))
}

struct Resume;

impl NegotiationModule for Resume {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        negotiation.config().stream_management
            && negotiation.resumption().is_some()
            && negotiation.has_feature("sm", ns::SM)
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            let Some(resumption) = negotiation.resumption() else {
                return Ok(ModuleOutcome::NotApplicable);
            };
            let request = Element::new("resume", ns::SM)
                .with_attr("previd", resumption.id.as_str())
                .with_attr("h", resumption.inbound.to_string());
            let reply = negotiation.request_nonza(request, verdict("resumed")).await?;
            if reply.name() == "failed" {
                warn!(previd = %resumption.id, "Stream resumption refused, binding a new session");
                return Ok(ModuleOutcome::NotApplicable);
            }

            info!(previd = %resumption.id, "Stream resumed");
            let jid = resumption.jid.clone();
            negotiation.update_session(|s| {
                s.resumed = true;
                s.sm_enabled = true;
                s.jid = jid;
            });
            Ok(ModuleOutcome::Success)
        })
    }
}

struct Enable;

impl NegotiationModule for Enable {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        let session = negotiation.session();
        negotiation.config().stream_management
            && !session.resumed
            && !session.sm_enabled
            && negotiation.has_feature("sm", ns::SM)
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            let request = Element::new("enable", ns::SM).with_attr("resume", "true");
            let reply = negotiation.request_nonza(request, verdict("enabled")).await?;
            if reply.name() == "failed" {
                warn!("Server refused to enable stream management");
                return Ok(ModuleOutcome::NotApplicable);
            }
            info!(id = ?reply.attr("id"), resume = ?reply.attr("resume"), "Stream management enabled");
            negotiation.update_session(|s| s.sm_enabled = true);
            Ok(ModuleOutcome::Success)
        })
    }
}
