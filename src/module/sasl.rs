//! SASL authentication (RFC 6120 section 6) and the simple mechanisms.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info, warn};

use super::scram::ScramSha256;
use super::{ModuleOutcome, Negotiation, NegotiationModule};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::ns;
use crate::transport::BoxFuture;
use crate::xml::Element;

pub(super) const SCRAM_SHA_256: &str = "sasl-scram-sha-256";
pub(super) const PLAIN: &str = "sasl-plain";
pub(super) const ANONYMOUS: &str = "sasl-anonymous";

/// Client side of one SASL mechanism. Errors are failure reasons.
pub(super) trait Mechanism: Send {
    fn initial_response(&mut self) -> std::result::Result<Vec<u8>, String>;

    fn respond(&mut self, _challenge: &[u8]) -> std::result::Result<Vec<u8>, String> {
        Err("unexpected challenge".to_string())
    }

    /// Check the additional data carried by `<success/>`.
    fn verify_success(&mut self, _additional: &[u8]) -> std::result::Result<(), String> {
        Ok(())
    }
}

struct Plain {
    username: String,
    password: String,
}

impl Mechanism for Plain {
    fn initial_response(&mut self) -> std::result::Result<Vec<u8>, String> {
        Ok(format!("\0{}\0{}", self.username, self.password).into_bytes())
    }
}

struct Anonymous;

impl Mechanism for Anonymous {
    fn initial_response(&mut self) -> std::result::Result<Vec<u8>, String> {
        Ok(Vec::new())
    }
}

/// Mechanism names offered in the current features.
fn offered_mechanisms(negotiation: &Negotiation) -> Vec<String> {
    negotiation
        .feature("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|c| c.is("mechanism", ns::SASL))
                .map(|c| c.text().trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn offers(negotiation: &Negotiation, mechanism: &str) -> bool {
    offered_mechanisms(negotiation)
        .iter()
        .any(|m| m.eq_ignore_ascii_case(mechanism))
}

/// SASL payloads travel base64-encoded; `=` stands for an empty one.
fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64.encode(data)
    }
}

fn decode_payload(element: &Element) -> Result<Vec<u8>> {
    let text = element.text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|e| Error::Protocol(format!("invalid base64 in SASL {}: {}", element.name(), e)))
}

fn failure_condition(failure: &Element) -> String {
    failure
        .children()
        .find(|c| c.namespace() == ns::SASL && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "not-authorized".to_string())
}

/// Run the auth exchange, then restart the stream on success.
async fn authenticate(
    negotiation: &Negotiation,
    mechanism_name: &str,
    mut mechanism: Box<dyn Mechanism>,
) -> Result<ModuleOutcome> {
    let initial = match mechanism.initial_response() {
        Ok(initial) => initial,
        Err(reason) => return Ok(ModuleOutcome::Failure(reason)),
    };
    let reply_filter = || {
        Filter::element("challenge", ns::SASL)
            .or(Filter::element("success", ns::SASL))
            .or(Filter::element("failure", ns::SASL))
    };

    debug!(mechanism = mechanism_name, "SASL: Sending auth");
    let mut reply = negotiation
        .request_nonza(
            Element::new("auth", ns::SASL)
                .with_attr("mechanism", mechanism_name)
                .with_text(&encode_payload(&initial)),
            reply_filter(),
        )
        .await?;

    loop {
        match reply.name() {
            "challenge" => {
                let challenge = decode_payload(&reply)?;
                let response = match mechanism.respond(&challenge) {
                    Ok(response) => response,
                    Err(reason) => {
                        let _ = negotiation.send(Element::new("abort", ns::SASL)).await;
                        return Ok(ModuleOutcome::Failure(reason));
                    }
                };
                reply = negotiation
                    .request_nonza(
                        Element::new("response", ns::SASL).with_text(&encode_payload(&response)),
                        reply_filter(),
                    )
                    .await?;
            }
            "success" => {
                let additional = decode_payload(&reply)?;
                if let Err(reason) = mechanism.verify_success(&additional) {
                    warn!(mechanism = mechanism_name, reason = %reason, "SASL: Server verification failed");
                    return Ok(ModuleOutcome::Failure(reason));
                }
                info!(mechanism = mechanism_name, "SASL: Authenticated");
                negotiation.update_session(|s| s.mechanism = Some(mechanism_name.to_string()));
                negotiation.restart_stream().await?;
                return Ok(ModuleOutcome::Success);
            }
            _ => {
                let condition = failure_condition(&reply);
                warn!(mechanism = mechanism_name, condition = %condition, "SASL: Authentication failed");
                return Ok(ModuleOutcome::Failure(format!(
                    "authentication failed: {}",
                    condition
                )));
            }
        }
    }
}

struct SaslModule {
    mechanism: &'static str,
}

impl SaslModule {
    fn build(&self, negotiation: &Negotiation) -> Option<Box<dyn Mechanism>> {
        match self.mechanism {
            "ANONYMOUS" => Some(Box::new(Anonymous)),
            "PLAIN" => negotiation.credentials().map(|c| {
                Box::new(Plain {
                    username: c.username.clone(),
                    password: c.password.clone(),
                }) as Box<dyn Mechanism>
            }),
            "SCRAM-SHA-256" => negotiation
                .credentials()
                .map(|c| Box::new(ScramSha256::new(c)) as Box<dyn Mechanism>),
            _ => None,
        }
    }
}

impl NegotiationModule for SaslModule {
    fn is_applicable(&self, negotiation: &Negotiation) -> bool {
        if !offers(negotiation, self.mechanism) {
            return false;
        }
        match self.mechanism {
            "ANONYMOUS" => negotiation.credentials().is_none(),
            "PLAIN" => {
                negotiation.credentials().is_some()
                    && (negotiation.session().encrypted
                        || negotiation.config().allow_plain_without_tls)
            }
            _ => negotiation.credentials().is_some(),
        }
    }

    fn negotiate<'a>(&'a self, negotiation: &'a Negotiation) -> BoxFuture<'a, Result<ModuleOutcome>> {
        Box::pin(async move {
            match self.build(negotiation) {
                Some(mechanism) => authenticate(negotiation, self.mechanism, mechanism).await,
                None => Ok(ModuleOutcome::NotApplicable),
            }
        })
    }
}

pub(super) fn create_scram_sha_256() -> Box<dyn NegotiationModule> {
    Box::new(SaslModule {
        mechanism: "SCRAM-SHA-256",
    })
}

pub(super) fn create_plain() -> Box<dyn NegotiationModule> {
    Box::new(SaslModule { mechanism: "PLAIN" })
}

pub(super) fn create_anonymous() -> Box<dyn NegotiationModule> {
    Box::new(SaslModule {
        mechanism: "ANONYMOUS",
    })
}
