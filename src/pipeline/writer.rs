//! Writer task: drains the outbound queue in FIFO order.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use super::{Outbound, WriterParts};
use crate::connection::attempt::Attempt;
use crate::error::FailureReason;
use crate::logging::TRAFFIC_TARGET;

pub(super) async fn run(attempt: Arc<Attempt>, parts: WriterParts) {
    let conn_id = attempt.conn_id;
    let mut shutdown = attempt.shutdown_signal();
    let WriterParts {
        mut half,
        mut queue,
    } = parts;

    loop {
        let next = tokio::select! {
            biased;
            _ = super::stopped(&mut shutdown) => None,
            message = queue.recv() => message,
        };
        let Some(message) = next else {
            debug!(conn_id, "Writer stopped");
            return;
        };

        let text = match message {
            Outbound::Detach(reply) => {
                debug!(conn_id, "Writer detached");
                let _ = reply.send(WriterParts { half, queue });
                return;
            }
            Outbound::Stanza(stanza) => stanza.to_xml(),
            Outbound::Raw(text) => text,
        };

        debug!(target: TRAFFIC_TARGET, conn_id, xml = %text, "SENT");
        let written = async {
            half.write_all(text.as_bytes()).await?;
            half.flush().await
        }
        .await;
        if let Err(e) = written {
            if attempt.is_closing() {
                debug!(conn_id, error = %e, "Write failed while closing");
            } else {
                error!(conn_id, error = %e, "Transport write error");
                attempt.fail(FailureReason::Transport(e.to_string()));
            }
            return;
        }
    }
}
