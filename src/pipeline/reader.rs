//! Reader task: bytes to units to stanzas, then collectors and listeners.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::{Inbound, Outbound, ReaderParts};
use crate::config::ParsingPolicy;
use crate::connection::attempt::Attempt;
use crate::error::{Error, FailureReason};
use crate::framing::{extract_unit, StreamHeader, Unit};
use crate::logging::TRAFFIC_TARGET;
use crate::ns;
use crate::stanza::{Stanza, StanzaKind};
use crate::xml::Element;

const READ_CHUNK: usize = 8192;

/// What the loop does after a unit.
enum Flow {
    Continue,
    /// Stop parsing and wait to be detached (TLS is about to start).
    Pause,
    Stop,
}

struct Reader {
    attempt: Arc<Attempt>,
    parts: ReaderParts,
}

pub(super) async fn run(
    attempt: Arc<Attempt>,
    parts: ReaderParts,
    mut detach: oneshot::Receiver<oneshot::Sender<ReaderParts>>,
) {
    let conn_id = attempt.conn_id;
    let mut shutdown = attempt.shutdown_signal();
    let mut reader = Reader { attempt, parts };
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut paused = false;

    if !reader.parts.leftover.is_empty() {
        match reader.drain_buffer().await {
            Flow::Continue => {}
            Flow::Pause => paused = true,
            Flow::Stop => return reader.finish(),
        }
    }

    loop {
        tokio::select! {
            biased;
            request = &mut detach => {
                match request {
                    Ok(reply) => {
                        debug!(conn_id, "Reader detached");
                        let _ = reply.send(reader.parts);
                        return;
                    }
                    // Handle dropped: the attempt is going away
                    Err(_) => return reader.finish(),
                }
            }
            _ = super::stopped(&mut shutdown) => {
                debug!(conn_id, "Reader stopped by shutdown");
                return reader.finish();
            }
            read = reader.parts.half.read(&mut read_buf), if !paused => {
                match read {
                    Ok(0) => {
                        reader.on_eof();
                        return reader.finish();
                    }
                    Ok(n) => {
                        trace!(conn_id, bytes = n, "Received data");
                        reader.parts.leftover.extend_from_slice(&read_buf[..n]);
                        match reader.drain_buffer().await {
                            Flow::Continue => {}
                            Flow::Pause => paused = true,
                            Flow::Stop => return reader.finish(),
                        }
                    }
                    Err(e) => {
                        if reader.attempt.is_closing() {
                            debug!(conn_id, error = %e, "Read error while closing");
                        } else {
                            error!(conn_id, error = %e, "Transport read error");
                            reader.attempt.fail(FailureReason::Transport(e.to_string()));
                        }
                        return reader.finish();
                    }
                }
            }
        }
    }
}

impl Reader {
    fn finish(self) {
        self.attempt.mark_reader_done();
    }

    fn on_eof(&self) {
        if self.attempt.is_closing() {
            debug!(conn_id = self.attempt.conn_id, "Transport closed after stream close");
        } else {
            warn!(conn_id = self.attempt.conn_id, "Transport closed by peer");
            self.attempt.fail(FailureReason::ClosedByPeer);
        }
    }

    /// Cut every complete unit out of the buffer and handle it.
    async fn drain_buffer(&mut self) -> Flow {
        let mut consumed = 0;
        let mut flow = Flow::Continue;
        loop {
            match extract_unit(&self.parts.leftover[consumed..]) {
                Ok(Some((unit, used))) => {
                    consumed += used;
                    flow = self.handle_unit(unit).await;
                    if !matches!(flow, Flow::Continue) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(conn_id = self.attempt.conn_id, error = %e, "Malformed stream");
                    self.attempt.fail(FailureReason::Protocol(e.to_string()));
                    return Flow::Stop;
                }
            }
        }
        if consumed > 0 {
            self.parts.leftover.drain(..consumed);
        }
        if self.parts.leftover.iter().all(u8::is_ascii_whitespace) {
            self.parts.leftover.clear();
        }

        let limit = self.attempt.config.max_stanza_size;
        if self.parts.leftover.len() > limit {
            error!(
                conn_id = self.attempt.conn_id,
                buffer_bytes = self.parts.leftover.len(),
                limit,
                "Inbound unit exceeds size limit"
            );
            self.attempt.fail(FailureReason::Protocol(format!(
                "inbound unit exceeds {} bytes",
                limit
            )));
            return Flow::Stop;
        }
        flow
    }

    async fn handle_unit(&mut self, unit: Unit) -> Flow {
        let conn_id = self.attempt.conn_id;
        match unit {
            Unit::StreamOpen(header) => {
                debug!(target: TRAFFIC_TARGET, conn_id, xml = %header, "RECV");
                match StreamHeader::parse(&header) {
                    Ok(header) => {
                        debug!(conn_id, stream_id = ?header.id, from = ?header.from, "Stream opened by server");
                        self.attempt.update_session(|s| s.stream_id = header.id);
                        Flow::Continue
                    }
                    Err(e) => {
                        self.attempt.fail(FailureReason::Protocol(e.to_string()));
                        Flow::Stop
                    }
                }
            }
            Unit::StreamClose => {
                debug!(target: TRAFFIC_TARGET, conn_id, xml = crate::framing::STREAM_CLOSE, "RECV");
                if !self.attempt.is_closing() {
                    warn!(conn_id, "Stream closed by server");
                    self.attempt.fail(FailureReason::ClosedByPeer);
                }
                Flow::Stop
            }
            Unit::Element(xml) => {
                debug!(target: TRAFFIC_TARGET, conn_id, xml = %xml, "RECV");
                let element = match Element::parse(&xml) {
                    Ok(element) => element,
                    Err(e) => return self.unparseable(e),
                };
                if element.is("error", ns::STREAMS) {
                    let reason = stream_error(&element);
                    error!(conn_id, reason = %reason, "Stream error from server");
                    self.attempt.fail(reason);
                    return Flow::Stop;
                }
                match Stanza::from_element(element) {
                    Ok(stanza) => self.handle_stanza(stanza).await,
                    Err(e) => self.unparseable(e),
                }
            }
        }
    }

    fn unparseable(&self, e: Error) -> Flow {
        match self.attempt.config.parsing_policy {
            ParsingPolicy::Escalate => {
                error!(conn_id = self.attempt.conn_id, error = %e, "Unparseable inbound element");
                self.attempt.fail(FailureReason::Protocol(e.to_string()));
                Flow::Stop
            }
            ParsingPolicy::DropAndLog => {
                warn!(conn_id = self.attempt.conn_id, error = %e, "Dropping unparseable inbound element");
                Flow::Continue
            }
        }
    }

    async fn handle_stanza(&mut self, stanza: Stanza) -> Flow {
        if let Stanza::Nonza(element) = &stanza {
            if element.namespace() == ns::SM {
                match element.name() {
                    "r" => {
                        self.answer_ack_request();
                        return Flow::Continue;
                    }
                    "a" => {
                        if let Some(h) = element.attr("h").and_then(|h| h.parse().ok()) {
                            self.attempt.sm_on_ack(h);
                        }
                        return Flow::Continue;
                    }
                    "enabled" => {
                        let resumable = matches!(element.attr("resume"), Some("true" | "1"));
                        self.attempt
                            .sm_on_enabled(element.attr("id").map(str::to_string), resumable);
                    }
                    "resumed" => self.attempt.sm_on_resumed(),
                    _ => {}
                }
            }
        } else {
            self.attempt.sm_count_inbound();
        }

        let claimed = self.attempt.collectors.deliver(&stanza);

        if stanza.is_element("proceed", ns::TLS) {
            return Flow::Pause;
        }
        if stanza.kind() != StanzaKind::Nonza {
            // Listeners that fall behind hold the reader up to their time bound
            if self.parts.dispatch.send(Inbound { stanza, claimed }).await.is_err() {
                trace!(conn_id = self.attempt.conn_id, "Dispatcher gone, stanza not dispatched");
            }
        }
        Flow::Continue
    }

    fn answer_ack_request(&self) {
        let h = self.attempt.sm_inbound();
        let answer = Element::new("a", ns::SM).with_attr("h", h.to_string());
        if let Err(e) = self
            .attempt
            .try_enqueue(Outbound::Stanza(Stanza::Nonza(answer)))
        {
            warn!(conn_id = self.attempt.conn_id, error = %e, "Could not answer ack request");
        }
    }
}

fn stream_error(element: &Element) -> FailureReason {
    let condition = element
        .children()
        .find(|c| c.namespace() == ns::STREAM_ERRORS && c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());
    let text = element
        .get_child("text", ns::STREAM_ERRORS)
        .map(Element::text)
        .filter(|t| !t.is_empty());
    FailureReason::StreamError { condition, text }
}
