//! Reply correlation: a filter plus a one-shot slot the reader loop fills.
//!
//! The outstanding set is kept in registration order. Delivery removes the
//! first matching entry under the lock and only then sends into its slot, so a
//! collector is satisfied at most once no matter how many matching stanzas
//! arrive, and a concurrent [`Collector::cancel`] either wins or finds nothing
//! to remove.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, FailureReason, Result};
use crate::filter::Filter;
use crate::stanza::Stanza;

/// What ends up in a collector's slot.
#[derive(Debug)]
enum Delivery {
    Stanza(Stanza),
    Closed,
    Failed(FailureReason),
}

/// Why the outstanding set was shut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly disconnect by us.
    Closed,
    Failed(FailureReason),
}

impl CloseReason {
    fn to_error(&self) -> Error {
        match self {
            CloseReason::Closed => Error::ConnectionClosed,
            CloseReason::Failed(reason) => Error::ConnectionFailed(reason.clone()),
        }
    }

    fn to_delivery(&self) -> Delivery {
        match self {
            CloseReason::Closed => Delivery::Closed,
            CloseReason::Failed(reason) => Delivery::Failed(reason.clone()),
        }
    }
}

struct Entry {
    id: u64,
    filter: Filter,
    /// Stanza id this collector waits on, for duplicate detection.
    request_id: Option<String>,
    slot: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    closed: Option<CloseReason>,
}

/// Outstanding collectors of one connection attempt.
#[derive(Default)]
pub struct CollectorSet {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl CollectorSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a collector whose deadline starts now.
    pub fn register(self: &Arc<Self>, filter: Filter, timeout: Duration) -> Result<Collector> {
        self.insert(filter, None, timeout)
    }

    /// Register a collector for the reply to `request_id`, refusing ids that
    /// are still awaited by another collector.
    pub fn register_reply(
        self: &Arc<Self>,
        request_id: &str,
        filter: Filter,
        timeout: Duration,
    ) -> Result<Collector> {
        self.insert(filter, Some(request_id.to_string()), timeout)
    }

    fn insert(
        self: &Arc<Self>,
        filter: Filter,
        request_id: Option<String>,
        timeout: Duration,
    ) -> Result<Collector> {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(reason.to_error());
        }
        if let Some(request_id) = &request_id {
            if state
                .entries
                .iter()
                .any(|e| e.request_id.as_deref() == Some(request_id.as_str()))
            {
                return Err(Error::DuplicateId(request_id.clone()));
            }
        }
        trace!(collector = id, filter = ?filter, "Collector registered");
        state.entries.push(Entry {
            id,
            filter,
            request_id,
            slot: tx,
        });
        drop(state);

        Ok(Collector {
            id,
            set: Arc::clone(self),
            rx,
            deadline,
            timeout,
        })
    }

    /// Offer an inbound stanza to the outstanding collectors.
    ///
    /// The first matching collector in registration order claims it. Returns
    /// true if one did.
    pub fn deliver(&self, stanza: &Stanza) -> bool {
        let mut state = self.lock();
        let mut search_from = 0;
        loop {
            let found = state.entries[search_from..]
                .iter()
                .position(|e| e.filter.matches(stanza));
            let Some(offset) = found else {
                return false;
            };
            let index = search_from + offset;
            let entry = state.entries.remove(index);
            match entry.slot.send(Delivery::Stanza(stanza.clone())) {
                Ok(()) => {
                    trace!(collector = entry.id, "Collector satisfied");
                    return true;
                }
                // The waiter went away between registration and now; offer to the next one
                Err(_) => search_from = index,
            }
        }
    }

    /// True while a collector registered for `request_id` is outstanding.
    pub fn has_outstanding_id(&self, request_id: &str) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|e| e.request_id.as_deref() == Some(request_id))
    }

    pub fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }

    /// Cancel every outstanding collector with `reason` and refuse new ones.
    ///
    /// Only the first call has an effect.
    pub fn close(&self, reason: CloseReason) {
        let entries = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.entries)
        };
        debug!(count = entries.len(), reason = ?reason, "Cancelling outstanding collectors");
        for entry in entries {
            let _ = entry.slot.send(reason.to_delivery());
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                state.entries.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Caller side of a registered collector.
///
/// Dropping it deregisters it.
pub struct Collector {
    id: u64,
    set: Arc<CollectorSet>,
    rx: oneshot::Receiver<Delivery>,
    deadline: Instant,
    timeout: Duration,
}

impl Collector {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// A handle that can cancel this collector from another task.
    pub fn canceller(&self) -> CollectorCanceller {
        CollectorCanceller {
            id: self.id,
            set: Arc::clone(&self.set),
        }
    }

    /// Wait for the matching stanza, the deadline, a cancellation, or the
    /// connection going away, whichever comes first.
    pub async fn await_result(mut self) -> Result<Stanza> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(delivery)) => into_result(delivery),
            // Sender dropped without a delivery: removed by a canceller
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => self.after_deadline(),
        }
    }

    fn after_deadline(&mut self) -> Result<Stanza> {
        let no_response = Error::NoResponse {
            timeout: self.timeout,
        };
        if self.set.remove(self.id) {
            return Err(no_response);
        }
        // Lost the race against a delivery, a close or a canceller
        match self.rx.try_recv() {
            Ok(delivery) => into_result(delivery),
            Err(oneshot::error::TryRecvError::Closed) => Err(Error::Cancelled),
            Err(oneshot::error::TryRecvError::Empty) => Err(no_response),
        }
    }

    /// Deregister. A no-op if the collector was already satisfied.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

fn into_result(delivery: Delivery) -> Result<Stanza> {
    match delivery {
        Delivery::Stanza(stanza) => Ok(stanza),
        Delivery::Closed => Err(Error::ConnectionClosed),
        Delivery::Failed(reason) => Err(Error::ConnectionFailed(reason)),
    }
}

/// Cancels a collector someone else is waiting on.
#[derive(Clone)]
pub struct CollectorCanceller {
    id: u64,
    set: Arc<CollectorSet>,
}

impl CollectorCanceller {
    /// Returns false if the collector had already been satisfied, timed out or closed.
    pub fn cancel(&self) -> bool {
        self.set.remove(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Iq, IqOutcome};
    use crate::xml::Element;

    fn stanza(xml: &str) -> Stanza {
        Stanza::from_element(Element::parse(xml).unwrap()).unwrap()
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_first_match_resolves() {
        let set = CollectorSet::new();
        let collector = set.register(Filter::id("q1"), TIMEOUT).unwrap();

        assert!(!set.deliver(&stanza("<iq type='result' id='other'/>")));
        assert!(set.deliver(&stanza("<iq type='result' id='q1'/>")));
        // A duplicate reply finds nothing to satisfy
        assert!(!set.deliver(&stanza("<iq type='result' id='q1'/>")));
        assert_eq!(set.outstanding(), 0);

        let result = collector.await_result().await.unwrap();
        assert_eq!(result.id(), Some("q1"));
    }

    #[tokio::test]
    async fn test_two_matching_collectors_first_registered_wins() {
        let set = CollectorSet::new();
        let first = set.register(Filter::All, TIMEOUT).unwrap();
        let second = set.register(Filter::id("q1"), TIMEOUT).unwrap();

        assert!(set.deliver(&stanza("<iq type='result' id='q1'/>")));
        assert_eq!(set.outstanding(), 1);
        assert_eq!(first.await_result().await.unwrap().id(), Some("q1"));

        // The second collector is still outstanding and takes the next match
        assert!(set.deliver(&stanza("<iq type='result' id='q1'/>")));
        assert!(second.await_result().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_after_satisfaction_is_noop() {
        let set = CollectorSet::new();
        let collector = set.register(Filter::id("q1"), TIMEOUT).unwrap();
        let canceller = collector.canceller();

        assert!(set.deliver(&stanza("<iq type='result' id='q1'/>")));
        assert!(!canceller.cancel());
        assert!(collector.await_result().await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_satisfaction_prevents_delivery() {
        let set = CollectorSet::new();
        let collector = set.register(Filter::id("q1"), TIMEOUT).unwrap();
        let canceller = collector.canceller();

        assert!(canceller.cancel());
        assert!(!set.deliver(&stanza("<iq type='result' id='q1'/>")));
        assert_eq!(collector.await_result().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_racing_the_deadline_reports_cancelled() {
        let set = CollectorSet::new();
        let mut cancelled = set.register(Filter::id("q1"), TIMEOUT).unwrap();
        let mut answered = set.register(Filter::id("q2"), TIMEOUT).unwrap();

        assert!(cancelled.canceller().cancel());
        assert!(set.deliver(&stanza("<iq type='result' id='q2'/>")));

        assert_eq!(cancelled.after_deadline(), Err(Error::Cancelled));
        assert_eq!(answered.after_deadline().unwrap().id(), Some("q2"));
    }

    #[tokio::test]
    async fn test_dropping_collector_deregisters() {
        let set = CollectorSet::new();
        let collector = set.register(Filter::All, TIMEOUT).unwrap();
        collector.cancel();
        assert_eq!(set.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_collector() {
        let set = CollectorSet::new();
        let collector = set.register(Filter::id("q1"), Duration::from_secs(5)).unwrap();

        let result = collector.await_result().await;
        assert_eq!(
            result,
            Err(Error::NoResponse {
                timeout: Duration::from_secs(5)
            })
        );
        assert_eq!(set.outstanding(), 0);
        assert!(!set.deliver(&stanza("<iq type='result' id='q1'/>")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_before_deadline_is_a_response() {
        let set = CollectorSet::new();
        let request = Iq::get(Element::new("query", "jabber:iq:version")).with_id("q1");
        let collector = set
            .register_reply("q1", Filter::reply_to(&request), Duration::from_secs(5))
            .unwrap();

        let deliverer = Arc::clone(&set);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            deliverer.deliver(&stanza(
                "<iq type='error' id='q1'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            ));
        });

        let reply = collector.await_result().await.unwrap();
        assert_eq!(reply.as_iq().unwrap().outcome(), IqOutcome::Error);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_refused() {
        let set = CollectorSet::new();
        let _pending = set.register_reply("q1", Filter::id("q1"), TIMEOUT).unwrap();
        assert!(set.has_outstanding_id("q1"));
        assert!(matches!(
            set.register_reply("q1", Filter::id("q1"), TIMEOUT),
            Err(Error::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_close_cancels_all_once() {
        let set = CollectorSet::new();
        let a = set.register(Filter::All, TIMEOUT).unwrap();
        let b = set.register(Filter::id("x"), TIMEOUT).unwrap();

        set.close(CloseReason::Failed(FailureReason::ClosedByPeer));
        set.close(CloseReason::Closed);

        assert_eq!(
            a.await_result().await,
            Err(Error::ConnectionFailed(FailureReason::ClosedByPeer))
        );
        assert_eq!(
            b.await_result().await,
            Err(Error::ConnectionFailed(FailureReason::ClosedByPeer))
        );
        assert!(matches!(
            set.register(Filter::All, TIMEOUT),
            Err(Error::ConnectionFailed(_))
        ));
    }
}
