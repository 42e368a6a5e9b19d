//! Reader, writer and listener dispatch tasks of one connection attempt.
//!
//! The transport is split into a read half owned by the reader task and a
//! write half owned by the writer task. Both halves can be handed back
//! (detached) so the stream can be reunited, wrapped in TLS and split again.

mod dispatch;
mod reader;
mod writer;

use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use crate::connection::attempt::Attempt;
use crate::error::{Error, Result};
use crate::stanza::Stanza;
use crate::transport::{BoxStream, TlsUpgrader};

/// Capacity of the reader to dispatcher channel.
const DISPATCH_CAPACITY: usize = 1024;

/// Work item for the writer task.
pub(crate) enum Outbound {
    Stanza(Stanza),
    /// Pre-serialized stream-level markup (headers, close tag).
    Raw(String),
    /// Stop writing and hand the write half and the queue back.
    Detach(oneshot::Sender<WriterParts>),
}

pub(crate) struct WriterParts {
    half: WriteHalf<BoxStream>,
    queue: mpsc::Receiver<Outbound>,
}

pub(crate) struct ReaderParts {
    half: ReadHalf<BoxStream>,
    /// Bytes read but not yet consumed.
    leftover: Vec<u8>,
    dispatch: mpsc::Sender<Inbound>,
}

/// A stanza on its way to the listeners.
pub(crate) struct Inbound {
    stanza: Stanza,
    /// A collector already took it.
    claimed: bool,
}

/// Resolves once the attempt's shutdown flag is raised.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Spawn the reader, writer and dispatcher for a fresh transport.
pub(crate) fn start(attempt: &Arc<Attempt>, stream: BoxStream, queue: mpsc::Receiver<Outbound>) {
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CAPACITY);
    attempt.track(tokio::spawn(dispatch::run(Arc::clone(attempt), dispatch_rx)));
    spawn_io(attempt, stream, Vec::new(), queue, dispatch_tx);
}

fn spawn_io(
    attempt: &Arc<Attempt>,
    stream: BoxStream,
    leftover: Vec<u8>,
    queue: mpsc::Receiver<Outbound>,
    dispatch: mpsc::Sender<Inbound>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (detach_tx, detach_rx) = oneshot::channel();
    attempt.install_reader(detach_tx);
    attempt.track(tokio::spawn(reader::run(
        Arc::clone(attempt),
        ReaderParts {
            half: read_half,
            leftover,
            dispatch,
        },
        detach_rx,
    )));
    attempt.track(tokio::spawn(writer::run(
        Arc::clone(attempt),
        WriterParts {
            half: write_half,
            queue,
        },
    )));
}

/// Replace the transport with a TLS-wrapped one.
///
/// The reader is detached first so it cannot consume handshake bytes; the
/// writer is detached through the queue, after everything queued before the
/// request has been written.
pub(crate) async fn upgrade(
    attempt: &Arc<Attempt>,
    upgrader: &dyn TlsUpgrader,
    server_name: &str,
) -> Result<()> {
    let detach = attempt
        .take_reader_detach()
        .ok_or_else(|| attempt.closed_error())?;
    let (tx, rx) = oneshot::channel();
    detach.send(tx).map_err(|_| attempt.closed_error())?;
    let reader_parts = rx.await.map_err(|_| attempt.closed_error())?;

    let (tx, rx) = oneshot::channel();
    attempt
        .raw_sender()
        .send(Outbound::Detach(tx))
        .await
        .map_err(|_| attempt.closed_error())?;
    let writer_parts = rx.await.map_err(|_| attempt.closed_error())?;

    if attempt.is_torn_down() {
        return Err(attempt.closed_error());
    }
    if !reader_parts.leftover.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::Protocol(
            "unexpected data before TLS handshake".to_string(),
        ));
    }

    let stream = reader_parts.half.unsplit(writer_parts.half);
    let stream = upgrader.upgrade(stream, server_name).await?;
    info!(conn_id = attempt.conn_id, server_name, "Transport upgraded to TLS");
    spawn_io(
        attempt,
        stream,
        Vec::new(),
        writer_parts.queue,
        reader_parts.dispatch,
    );
    Ok(())
}
