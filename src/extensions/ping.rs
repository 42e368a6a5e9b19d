//! XEP-0199 XMPP Ping.

use tracing::debug;

use super::ExtensionManager;
use crate::connection::{Connection, WeakConnection};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::jid::Jid;
use crate::listener::{BoxError, ListenerId};
use crate::ns;
use crate::stanza::{Iq, IqOutcome, IqType, Stanza};
use crate::xml::Element;

/// Answers inbound pings and sends outbound ones.
pub struct PingManager {
    connection: WeakConnection,
    responder: ListenerId,
}

impl ExtensionManager for PingManager {
    fn create(connection: &Connection) -> Self {
        let weak = connection.downgrade();
        let responder = connection.add_listener(
            Filter::IqType(IqType::Get).and(Filter::namespace(ns::PING)),
            move |stanza: &Stanza| -> std::result::Result<(), BoxError> {
                let (Some(ping), Some(connection)) = (stanza.as_iq(), weak.upgrade()) else {
                    return Ok(());
                };
                debug!(from = ?ping.from, id = %ping.id, "Answering ping");
                connection.try_send(ping.result_reply(None))?;
                Ok(())
            },
        );
        Self {
            connection: connection.downgrade(),
            responder,
        }
    }
}

fn ping_request(to: Jid) -> Iq {
    Iq::get(Element::new("ping", ns::PING)).with_to(to)
}

impl PingManager {
    fn connection(&self) -> Result<Connection> {
        self.connection.upgrade().ok_or(Error::NotConnected)
    }

    /// Listener answering inbound pings.
    pub fn responder(&self) -> ListenerId {
        self.responder
    }

    /// Ping `jid`. False when it does not answer in time or answers with an
    /// error.
    pub async fn ping(&self, jid: Jid) -> Result<bool> {
        match self.connection()?.request(ping_request(jid)).await {
            Ok(reply) => Ok(reply.outcome() == IqOutcome::Result),
            Err(Error::NoResponse { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ping our server. Any answer counts, since servers without XEP-0199
    /// reply with an error but are still alive.
    pub async fn ping_server(&self) -> Result<bool> {
        let connection = self.connection()?;
        let server = Jid::new(None, &connection.config().domain, None);
        match connection.request(ping_request(server)).await {
            Ok(_) => Ok(true),
            Err(Error::NoResponse { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
