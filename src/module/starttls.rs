use tracing::info;

use super::{ModuleOutcome, Negotiation, NegotiationModule};
use crate::config::SecurityMode;
use crate::error::Result;
use crate::filter::Filter;
use crate::ns;
use crate::transport::BoxFuture;
use crate::xml::Element;

pub(super) const NAME: &str = "starttls";

pub(super) fn create() -> Box<dyn NegotiationModule> {
    Box::new(StartTls)
}

/// RFC 6120 STARTTLS upgrade.
struct StartTls;

impl NegotiationModule for StartTls {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        negotiation.config().security != SecurityMode::Disabled
            && !negotiation.session().encrypted
            && negotiation.has_feature("starttls", ns::TLS)
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            let reply = negotiation
                .request_nonza(
                    Element::new("starttls", ns::TLS),
                    Filter::element("proceed", ns::TLS).or(Filter::element("failure", ns::TLS)),
                )
                .await?;
            if reply.name() == "failure" {
                return Ok(ModuleOutcome::Failure("server refused STARTTLS".to_string()));
            }

            negotiation.upgrade_transport().await?;
            info!("STARTTLS: TLS handshake complete");
            negotiation.restart_stream().await?;
            Ok(ModuleOutcome::Success)
        })
    }
}
