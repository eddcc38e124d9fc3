/// Display state of a locally applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Optimistic<T> {
    /// Shown as `local` while the call is out; `prior` is kept for revert.
    PendingLocal { prior: T, local: T },
    /// The server's version replaced the local guess.
    Committed(T),
    /// The call failed; exactly the prior value is shown again.
    Reverted(T),
}

impl<T> Optimistic<T> {
    pub fn pending(prior: T, local: T) -> Self {
        Optimistic::PendingLocal { prior, local }
    }

    /// What the view should render right now.
    pub fn shown(&self) -> &T {
        match self {
            Optimistic::PendingLocal { local, .. } => local,
            Optimistic::Committed(v) | Optimistic::Reverted(v) => v,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Optimistic::PendingLocal { .. })
    }

    /// Settle a pending change with the call's result. Settled states are final.
    pub fn reconcile<E>(self, result: Result<T, E>) -> Self {
        match (self, result) {
            (Optimistic::PendingLocal { .. }, Ok(server)) => Optimistic::Committed(server),
            (Optimistic::PendingLocal { prior, .. }, Err(_)) => Optimistic::Reverted(prior),
            (settled, _) => settled,
        }
    }

    pub fn into_shown(self) -> T {
        match self {
            Optimistic::PendingLocal { local, .. } => local,
            Optimistic::Committed(v) | Optimistic::Reverted(v) => v,
        }
    }
}
