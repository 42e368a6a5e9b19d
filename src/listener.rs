//! Standing stanza registrations.
//!
//! Listeners are kept in a map ordered by their registration handle, so
//! iterating the map yields registration order. Each registration carries an
//! in-flight flag: a listener runs at most one call at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::filter::Filter;
use crate::stanza::Stanza;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every inbound stanza matching the filter it was registered with.
///
/// Runs on a blocking worker with a time bound; an error or panic is logged
/// and never reaches the pipeline.
pub trait StanzaListener: Send + Sync + 'static {
    fn on_stanza(&self, stanza: &Stanza) -> Result<(), BoxError>;
}

impl<F> StanzaListener for F
where
    F: Fn(&Stanza) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn on_stanza(&self, stanza: &Stanza) -> Result<(), BoxError> {
        self(stanza)
    }
}

/// Registration handle, also the dispatch order key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

struct Registered {
    filter: Filter,
    listener: Arc<dyn StanzaListener>,
    busy: Arc<AtomicBool>,
}

/// A listener selected for one stanza.
#[derive(Clone)]
pub struct Matched {
    pub id: ListenerId,
    pub listener: Arc<dyn StanzaListener>,
    busy: Arc<AtomicBool>,
}

impl Matched {
    /// Claim the listener for a call; `None` while an earlier call is still running.
    pub fn try_begin(&self) -> Option<InFlight> {
        (!self.busy.swap(true, Ordering::AcqRel)).then(|| InFlight(Arc::clone(&self.busy)))
    }
}

/// Marks a listener call as running; released on drop, panics included.
pub struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<BTreeMap<ListenerId, Registered>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: Filter, listener: Arc<dyn StanzaListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Registered {
                    filter,
                    listener,
                    busy: Arc::new(AtomicBool::new(false)),
                },
            );
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Listeners whose filter accepts `stanza`, in registration order.
    pub fn matching(&self, stanza: &Stanza) -> Vec<Matched> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, entry)| entry.filter.matches(stanza))
            .map(|(id, entry)| Matched {
                id: *id,
                listener: Arc::clone(&entry.listener),
                busy: Arc::clone(&entry.busy),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
