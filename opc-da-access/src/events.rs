//! Typed group events and the handler registries they are dispatched through.

use crate::typedefs::{GroupHandle, Hresult, ItemHandle, ItemValue};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Values pushed by the server, either unsolicited or answering a read or refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChangeEvent {
    /// Group handle echoed by the server.
    pub group_handle: GroupHandle,
    /// Zero for unsolicited changes; otherwise the caller's transaction id.
    pub transaction_id: u32,
    pub master_quality: Hresult,
    pub master_error: Hresult,
    pub values: Vec<ItemValue>,
}

/// Read-complete notifications carry the same payload as data changes.
pub type ReadCompleteEvent = DataChangeEvent;

/// Completion of an asynchronous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCompleteEvent {
    pub group_handle: GroupHandle,
    pub transaction_id: u32,
    pub master_error: Hresult,
    /// (client handle, status) per written item.
    pub results: Vec<(ItemHandle, Hresult)>,
}

/// Confirmation that an outstanding transaction was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelCompleteEvent {
    pub group_handle: GroupHandle,
    pub transaction_id: u32,
}

/// Any of the four notification kinds, as yielded by `Group::event_stream`.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    DataChange(DataChangeEvent),
    ReadComplete(ReadCompleteEvent),
    WriteComplete(WriteCompleteEvent),
    CancelComplete(CancelCompleteEvent),
}

/// Identifies an attached handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

pub(crate) type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handlers of one event kind.
///
/// Delivery snapshots the list and calls the handlers outside the lock, so
/// a handler may attach or detach handlers without deadlocking.
pub(crate) struct HandlerList<E> {
    kind: &'static str,
    entries: RwLock<Vec<(HandlerId, Handler<E>)>>,
}

impl<E> HandlerList<E> {
    pub(crate) const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, id: HandlerId, handler: Handler<E>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn snapshot(&self) -> Vec<Handler<E>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    /// Calls every handler; a panicking handler is logged and skipped.
    pub(crate) fn dispatch(&self, event: &E) {
        for handler in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = self.kind, "Event handler panicked");
            }
        }
    }
}

/// The four handler registries of one group.
pub(crate) struct EventHandlers {
    pub(crate) data_change: HandlerList<DataChangeEvent>,
    pub(crate) read_complete: HandlerList<ReadCompleteEvent>,
    pub(crate) write_complete: HandlerList<WriteCompleteEvent>,
    pub(crate) cancel_complete: HandlerList<CancelCompleteEvent>,
    next_id: AtomicU64,
}

impl EventHandlers {
    pub(crate) const fn new() -> Self {
        Self {
            data_change: HandlerList::new("data_change"),
            read_complete: HandlerList::new("read_complete"),
            write_complete: HandlerList::new("write_complete"),
            cancel_complete: HandlerList::new("cancel_complete"),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        self.data_change.remove(id)
            || self.read_complete.remove(id)
            || self.write_complete.remove(id)
            || self.cancel_complete.remove(id)
    }

    /// Detaches every handler, dropping whatever they captured.
    pub(crate) fn clear(&self) {
        self.data_change.clear();
        self.read_complete.clear();
        self.write_complete.clear();
        self.cancel_complete.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.data_change.len()
            + self.read_complete.len()
            + self.write_complete.len()
            + self.cancel_complete.len()
    }
}
