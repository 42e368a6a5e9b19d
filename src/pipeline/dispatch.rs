//! Listener dispatch.
//!
//! Stanzas are handed to matching listeners one at a time, in arrival order
//! and, per stanza, in listener registration order. Each invocation runs on
//! the blocking pool under `listener_timeout`, so a slow or panicking
//! listener delays dispatch by a bounded amount and never reaches the reader.
//! A listener still busy with an earlier stanza is skipped for this one, so a
//! hung listener holds at most one blocking thread and never sees stanzas out
//! of order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{Inbound, Outbound};
use crate::config::UnknownIqReplyMode;
use crate::connection::attempt::Attempt;
use crate::listener::Matched;
use crate::stanza::{Stanza, StanzaError};

pub(super) async fn run(attempt: Arc<Attempt>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { stanza, claimed }) = inbound.recv().await {
        if attempt.is_torn_down() {
            break;
        }
        let listeners = attempt.listeners.matching(&stanza);
        if listeners.is_empty() {
            if !claimed {
                reply_unhandled_iq(&attempt, &stanza).await;
            }
            continue;
        }

        let stanza = Arc::new(stanza);
        for matched in listeners {
            if attempt.is_torn_down() {
                return;
            }
            invoke(&attempt, matched, Arc::clone(&stanza)).await;
        }
    }
    debug!(conn_id = attempt.conn_id, "Dispatcher stopped");
}

async fn invoke(attempt: &Attempt, matched: Matched, stanza: Arc<Stanza>) {
    let conn_id = attempt.conn_id;
    let id = matched.id;
    let Some(in_flight) = matched.try_begin() else {
        warn!(conn_id, listener = ?id, "Listener still busy with an earlier stanza, skipping");
        return;
    };
    let limit = attempt.config.listener_timeout;
    let listener = matched.listener;
    let task = tokio::task::spawn_blocking(move || {
        let _in_flight = in_flight;
        listener.on_stanza(&stanza)
    });
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(conn_id, listener = ?id, error = %e, "Listener failed"),
        Ok(Err(join)) if join.is_panic() => {
            error!(conn_id, listener = ?id, "Listener panicked")
        }
        Ok(Err(join)) => debug!(conn_id, listener = ?id, error = %join, "Listener cancelled"),
        Err(_) => warn!(
            conn_id,
            listener = ?id,
            timeout_ms = limit.as_millis() as u64,
            "Listener timed out, moving on"
        ),
    }
}

/// Answer a get/set IQ nobody handled, unless configured not to.
async fn reply_unhandled_iq(attempt: &Attempt, stanza: &Stanza) {
    let Some(iq) = stanza.as_iq().filter(|iq| iq.is_request()) else {
        return;
    };
    if attempt.config.unknown_iq_reply == UnknownIqReplyMode::DoNotReply {
        debug!(conn_id = attempt.conn_id, id = %iq.id, "Ignoring unhandled IQ");
        return;
    }
    debug!(
        conn_id = attempt.conn_id,
        id = %iq.id,
        namespace = ?iq.payload_namespace(),
        "Replying service-unavailable to unhandled IQ"
    );
    let reply = iq.error_reply(StanzaError::service_unavailable());
    if let Err(e) = attempt.enqueue(Outbound::Stanza(reply.into())).await {
        debug!(conn_id = attempt.conn_id, error = %e, "Could not reply to unhandled IQ");
    }
}
