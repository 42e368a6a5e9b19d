//! Per-connection extension managers.
//!
//! A manager is a singleton per connection, created on first lookup. The
//! registry lives inside the connection, and managers only hold a
//! [`WeakConnection`](crate::WeakConnection), so neither keeps the other alive.

pub mod ping;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::connection::Connection;

/// An extension manager that can be built for a connection.
pub trait ExtensionManager: Send + Sync + 'static {
    fn create(connection: &Connection) -> Self;
}

type Slot = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct ExtensionRegistry {
    slots: Mutex<HashMap<TypeId, Slot>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the instance of `M`, building it with `factory` on first access.
    ///
    /// Concurrent first lookups run `factory` once; the others wait for it.
    /// The map lock is not held while `factory` runs, so a factory may look up
    /// other managers (but not its own kind).
    pub fn get_or_create<M, F>(&self, factory: F) -> Arc<M>
    where
        M: Send + Sync + 'static,
        F: FnOnce() -> M,
    {
        let slot: Arc<OnceLock<Arc<M>>> = {
            let mut slots = self.lock();
            let entry = slots
                .entry(TypeId::of::<M>())
                .or_insert_with(|| Box::new(Arc::new(OnceLock::<Arc<M>>::new())));
            match entry.downcast_ref::<Arc<OnceLock<Arc<M>>>>() {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(OnceLock::new());
                    *entry = Box::new(Arc::clone(&slot));
                    slot
                }
            }
        };
        Arc::clone(slot.get_or_init(|| Arc::new(factory())))
    }

    /// The instance of `M`, if it was created already.
    pub fn get<M: Send + Sync + 'static>(&self) -> Option<Arc<M>> {
        self.lock()
            .get(&TypeId::of::<M>())
            .and_then(|entry| entry.downcast_ref::<Arc<OnceLock<Arc<M>>>>())
            .and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
