use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

/// One outstanding operation per entity id. A booking is keyed by its own
/// id; a create is keyed by the barber it targets.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    pending: Arc<DashMap<Ulid, &'static str>>,
}

/// Releases its entity when dropped, on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    pending: Arc<DashMap<Ulid, &'static str>>,
    id: Ulid,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `op`. Returns the operation already holding it on refusal.
    pub fn try_begin(&self, id: Ulid, op: &'static str) -> Result<InFlightGuard, &'static str> {
        match self.pending.entry(id) {
            Entry::Occupied(held) => Err(*held.get()),
            Entry::Vacant(slot) => {
                slot.insert(op);
                Ok(InFlightGuard {
                    pending: self.pending.clone(),
                    id,
                })
            }
        }
    }

    pub fn is_busy(&self, id: &Ulid) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl InFlightGuard {
    pub fn id(&self) -> Ulid {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
