//! In-flight request bookkeeping.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BrokerError, Result};
use crate::protocol::CorrelationId;

/// Single-use channel a task's outcome is delivered on.
pub type ReplySender = oneshot::Sender<Result<Bytes>>;

/// One logical request travelling from `send` to a worker.
#[derive(Debug)]
pub struct Task {
    pub id: CorrelationId,
    pub request: Bytes,
    pub reply: ReplySender,
    pub enqueued_at: Instant,
}

/// Outcome of [`PendingTable::register`].
#[derive(Debug)]
pub enum Registration {
    /// The task is now pending.
    Registered,
    /// The caller stopped waiting before the task reached a worker.
    CallerGone,
    /// Another live task holds the id; the reply channel is handed back.
    Duplicate(ReplySender),
}

/// Map of correlation id to the reply channel of the task awaiting it.
///
/// Removing an entry transfers ownership of the sender, so each task is
/// resolved at most once no matter how many paths race to resolve it.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<CorrelationId, ReplySender>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task's reply channel under `id`.
    pub fn register(&self, id: CorrelationId, reply: ReplySender) -> Registration {
        if reply.is_closed() {
            return Registration::CallerGone;
        }
        match self.entries.entry(id) {
            Entry::Occupied(_) => Registration::Duplicate(reply),
            Entry::Vacant(slot) => {
                // The caller may drop its receiver between the check above
                // and the insert; its own `remove` then finds nothing.
                let caller_gone = slot.insert(reply).is_closed();
                if caller_gone {
                    self.entries.remove_if(&id, |_, reply| reply.is_closed());
                    return Registration::CallerGone;
                }
                Registration::Registered
            }
        }
    }

    /// Deliver `result` to the task pending under `id`.
    ///
    /// Returns `false` if no task is pending under that id.
    pub fn resolve(&self, id: &CorrelationId, result: Result<Bytes>) -> bool {
        match self.entries.remove(id) {
            Some((_, reply)) => {
                // The caller may have given up in the meantime.
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every pending task with an error built by `make_error`.
    ///
    /// Returns the number of tasks failed.
    pub fn fail_all(&self, make_error: impl Fn() -> BrokerError) -> usize {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(id, Err(make_error())))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
