//! State shared by everything that lives for one connection attempt: the
//! pipeline tasks, the negotiation context and the public handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::state::{ConnectionState, StateMachine};
use crate::collector::{CloseReason, CollectorSet};
use crate::config::{BackpressurePolicy, Config};
use crate::error::{Error, FailureReason, Result};
use crate::jid::Jid;
use crate::listener::ListenerRegistry;
use crate::pipeline::{Outbound, ReaderParts};
use crate::stanza::IdGenerator;
use crate::xml::Element;

/// What has been negotiated so far on the current attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    /// `id` of the server's latest stream header.
    pub stream_id: Option<String>,
    /// Latest `<stream:features/>`.
    pub features: Option<Element>,
    pub encrypted: bool,
    /// SASL mechanism that succeeded.
    pub mechanism: Option<String>,
    /// Full JID bound to the session.
    pub jid: Option<Jid>,
    /// The session was resumed rather than bound anew.
    pub resumed: bool,
    pub sm_enabled: bool,
}

/// Stream management resumption token kept from a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resumption {
    pub(crate) id: String,
    pub(crate) inbound: u32,
    pub(crate) jid: Option<Jid>,
}

#[derive(Debug, Default)]
struct SmState {
    enabled: bool,
    resumable: bool,
    id: Option<String>,
    /// Stanzas handled since enable, the `h` we report.
    inbound: u32,
    /// Last `h` the server acknowledged.
    acked: u32,
}

pub(crate) struct Attempt {
    pub(crate) conn_id: u64,
    pub(crate) config: Arc<Config>,
    pub(crate) state: Arc<StateMachine>,
    pub(crate) ids: Arc<IdGenerator>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) collectors: Arc<CollectorSet>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: watch::Sender<bool>,
    torn_down: AtomicBool,
    closing: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    session: RwLock<SessionInfo>,
    sm: Mutex<SmState>,
    reader_detach: Mutex<Option<oneshot::Sender<oneshot::Sender<ReaderParts>>>>,
    reader_done: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Attempt {
    pub(crate) fn new(
        conn_id: u64,
        config: Arc<Config>,
        state: Arc<StateMachine>,
        ids: Arc<IdGenerator>,
        listeners: Arc<ListenerRegistry>,
        resumption: Option<&Resumption>,
    ) -> (Arc<Attempt>, mpsc::Receiver<Outbound>) {
        let (outbound, queue) = mpsc::channel(config.outbound_queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let (reader_done, _) = watch::channel(false);
        let sm = SmState {
            id: resumption.map(|r| r.id.clone()),
            inbound: resumption.map(|r| r.inbound).unwrap_or(0),
            ..Default::default()
        };
        let attempt = Arc::new(Attempt {
            conn_id,
            config,
            state,
            ids,
            listeners,
            collectors: CollectorSet::new(),
            outbound,
            shutdown,
            torn_down: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            session: RwLock::new(SessionInfo::default()),
            sm: Mutex::new(sm),
            reader_detach: Mutex::new(None),
            reader_done,
            tasks: Mutex::new(Vec::new()),
        });
        (attempt, queue)
    }

    // Outbound queue

    /// Queue `message`, honouring the configured backpressure policy.
    pub(crate) async fn enqueue(&self, message: Outbound) -> Result<()> {
        if self.is_torn_down() {
            return Err(self.closed_error());
        }
        match self.config.backpressure {
            BackpressurePolicy::Block => self
                .outbound
                .send(message)
                .await
                .map_err(|_| self.closed_error()),
            BackpressurePolicy::FailFast => self.try_enqueue(message),
        }
    }

    /// Queue `message` without waiting.
    pub(crate) fn try_enqueue(&self, message: Outbound) -> Result<()> {
        if self.is_torn_down() {
            return Err(self.closed_error());
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => self.closed_error(),
        })
    }

    /// The error a caller sees once this attempt is over.
    pub(crate) fn closed_error(&self) -> Error {
        match self.close_reason() {
            Some(CloseReason::Failed(reason)) => Error::ConnectionFailed(reason),
            Some(CloseReason::Closed) => Error::ConnectionClosed,
            None => Error::NotConnected,
        }
    }

    // Session

    pub(crate) fn session(&self) -> SessionInfo {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update_session(&self, update: impl FnOnce(&mut SessionInfo)) {
        update(&mut self.session.write().unwrap_or_else(PoisonError::into_inner));
    }

    // Stream management counters, driven by the reader

    pub(crate) fn sm_on_enabled(&self, id: Option<String>, resumable: bool) {
        let mut sm = lock(&self.sm);
        sm.enabled = true;
        sm.resumable = resumable && id.is_some();
        sm.id = id;
        sm.inbound = 0;
        sm.acked = 0;
    }

    pub(crate) fn sm_on_resumed(&self) {
        let mut sm = lock(&self.sm);
        sm.enabled = true;
        sm.resumable = sm.id.is_some();
    }

    pub(crate) fn sm_count_inbound(&self) {
        let mut sm = lock(&self.sm);
        if sm.enabled {
            sm.inbound = sm.inbound.wrapping_add(1);
        }
    }

    pub(crate) fn sm_inbound(&self) -> u32 {
        lock(&self.sm).inbound
    }

    pub(crate) fn sm_on_ack(&self, h: u32) {
        let mut sm = lock(&self.sm);
        trace!(conn_id = self.conn_id, previous = sm.acked, h, "Server acknowledged stanzas");
        sm.acked = h;
    }

    /// Token for resuming this attempt's session on the next one, if it ended
    /// in failure while resumable.
    pub(crate) fn resumption(&self) -> Option<Resumption> {
        if !matches!(self.close_reason(), Some(CloseReason::Failed(_))) {
            return None;
        }
        let sm = lock(&self.sm);
        if !sm.resumable {
            return None;
        }
        Some(Resumption {
            id: sm.id.clone()?,
            inbound: sm.inbound,
            jid: self.session().jid,
        })
    }

    // Task bookkeeping

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
        if self.is_torn_down() {
            self.abort_tasks();
        }
    }

    pub(crate) fn install_reader(&self, detach: oneshot::Sender<oneshot::Sender<ReaderParts>>) {
        *lock(&self.reader_detach) = Some(detach);
    }

    pub(crate) fn take_reader_detach(&self) -> Option<oneshot::Sender<oneshot::Sender<ReaderParts>>> {
        lock(&self.reader_detach).take()
    }

    pub(crate) fn raw_sender(&self) -> &mpsc::Sender<Outbound> {
        &self.outbound
    }

    pub(crate) fn mark_reader_done(&self) {
        self.reader_done.send_replace(true);
    }

    /// Wait until the reader has stopped for good, at most `timeout`.
    pub(crate) async fn wait_reader_done(&self, timeout: Duration) -> bool {
        let mut done = self.reader_done.subscribe();
        tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    // Lifecycle

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    /// Move the connection to `Failed` and tear the attempt down.
    ///
    /// Only the first teardown of an attempt has any effect.
    pub(crate) fn fail(&self, reason: FailureReason) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(conn_id = self.conn_id, reason = %reason, "Connection attempt failed");
        self.state.transition(ConnectionState::Failed(reason.clone()));
        self.shut(CloseReason::Failed(reason));
    }

    /// Tear the attempt down without a state change; returns false if it was
    /// already torn down.
    pub(crate) fn teardown(&self, reason: CloseReason) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shut(reason);
        true
    }

    fn shut(&self, reason: CloseReason) {
        debug!(conn_id = self.conn_id, reason = ?reason, "Tearing down attempt");
        *lock(&self.close_reason) = Some(reason.clone());
        self.collectors.close(reason);
        self.shutdown.send_replace(true);
        lock(&self.reader_detach).take();
        self.abort_tasks();
        self.mark_reader_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::stanza::{Presence, Stanza};

    fn attempt_with(config: Config) -> (Arc<Attempt>, mpsc::Receiver<Outbound>) {
        let state = Arc::new(StateMachine::new(1));
        state.transition(ConnectionState::Connecting);
        Attempt::new(
            1,
            Arc::new(config),
            state,
            Arc::new(IdGenerator::new()),
            Arc::new(ListenerRegistry::new()),
            None,
        )
    }

    fn presence() -> Outbound {
        Outbound::Stanza(Stanza::Presence(Presence::available()))
    }

    #[tokio::test]
    async fn test_fail_fast_reports_full_queue() {
        let mut config = Config::new("example.com");
        config.outbound_queue_capacity = 1;
        config.backpressure = BackpressurePolicy::FailFast;
        let (attempt, _queue) = attempt_with(config);

        attempt.enqueue(presence()).await.unwrap();
        assert_eq!(attempt.enqueue(presence()).await, Err(Error::QueueFull));
        assert_eq!(attempt.try_enqueue(presence()), Err(Error::QueueFull));
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let mut config = Config::new("example.com");
        config.outbound_queue_capacity = 1;
        config.backpressure = BackpressurePolicy::Block;
        let (attempt, mut queue) = attempt_with(config);

        attempt.enqueue(presence()).await.unwrap();
        let waiting = {
            let attempt = Arc::clone(&attempt);
            tokio::spawn(async move { attempt.enqueue(presence()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        assert!(queue.recv().await.is_some());
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(queue.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_fail_closes_collectors_and_sets_state() {
        let (attempt, _queue) = attempt_with(Config::new("example.com"));
        let collector = attempt
            .collectors
            .register(Filter::All, Duration::from_secs(5))
            .unwrap();

        attempt.fail(FailureReason::ClosedByPeer);
        attempt.fail(FailureReason::Protocol("ignored".to_string()));

        assert_eq!(
            attempt.state.current(),
            ConnectionState::Failed(FailureReason::ClosedByPeer)
        );
        assert_eq!(
            collector.await_result().await,
            Err(Error::ConnectionFailed(FailureReason::ClosedByPeer))
        );
        assert_eq!(
            attempt.try_enqueue(presence()),
            Err(Error::ConnectionFailed(FailureReason::ClosedByPeer))
        );
        assert!(*attempt.shutdown_signal().borrow());
        assert!(attempt.wait_reader_done(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_resumption_only_after_failure() {
        let (attempt, _queue) = attempt_with(Config::new("example.com"));
        attempt.sm_on_enabled(Some("sm-1".to_string()), true);
        attempt.sm_count_inbound();
        attempt.sm_count_inbound();
        assert_eq!(attempt.resumption(), None);

        attempt.fail(FailureReason::ClosedByPeer);
        let token = attempt.resumption().unwrap();
        assert_eq!(token.id, "sm-1");
        assert_eq!(token.inbound, 2);

        let (closed, _queue) = attempt_with(Config::new("example.com"));
        closed.sm_on_enabled(Some("sm-2".to_string()), true);
        closed.teardown(CloseReason::Closed);
        assert_eq!(closed.resumption(), None);
    }

    #[tokio::test]
    async fn test_inbound_counted_only_when_enabled() {
        let (attempt, _queue) = attempt_with(Config::new("example.com"));
        attempt.sm_count_inbound();
        assert_eq!(attempt.sm_inbound(), 0);
        attempt.sm_on_enabled(None, false);
        attempt.sm_count_inbound();
        assert_eq!(attempt.sm_inbound(), 1);
    }
}
