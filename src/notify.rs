use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-barber change feed. Agendas subscribe to learn that their snapshot
/// went stale; a lagging receiver just refetches.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a barber's changes. Creates the channel if needed.
    pub fn subscribe(&self, barber_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(barber_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, barber_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&barber_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a deleted barber's channel; receivers see `Closed`.
    pub fn remove(&self, barber_id: &Ulid) {
        self.channels.remove(barber_id);
    }
}
