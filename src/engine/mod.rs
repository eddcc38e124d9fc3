mod conflict;
mod error;
pub mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use conflict::detect;
pub use error::{EngineError, ErrorKind, Invalid};
pub use lifecycle::{allowed_actions, transition, Action, IllegalTransition, Transition};
pub use mutations::{BookingUpdate, NewBooking};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<BarberSchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Blocks for one append, drains whatever else is already
/// queued, writes the batch with a single fsync, then answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = wal.append_batch(batch.iter().map(|(event, _)| event));
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "WAL commit failed: {e}");
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── State application ────────────────────────────────────

/// Copy a reschedule's new fields onto a booking.
fn apply_reschedule(booking: &mut Booking, event: &Event) {
    if let Event::BookingRescheduled {
        to_barber,
        span,
        duration_minutes,
        client_name,
        service_id,
        ..
    } = event
    {
        booking.barber_id = *to_barber;
        booking.span = *span;
        booking.duration_minutes = *duration_minutes;
        booking.client_name = client_name.clone();
        booking.service_id = *service_id;
    }
}

/// Apply a single-barber event. The caller holds the schedule's write lock.
fn apply_to_schedule(sched: &mut BarberSchedule, event: &Event, owner: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BarberUpdated { name, is_active, .. } => {
            sched.barber.name = name.clone();
            sched.barber.is_active = *is_active;
        }
        Event::BookingCreated { booking } => {
            owner.insert(booking.id, sched.id());
            sched.insert_booking(booking.clone());
        }
        Event::BookingRescheduled { id, .. } => {
            // Removed and reinserted to keep the start-time order.
            if let Some(mut booking) = sched.remove_booking(*id) {
                apply_reschedule(&mut booking, event);
                sched.insert_booking(booking);
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = sched.booking_mut(*id) {
                booking.status = *status;
            }
        }
        Event::BookingDeleted { id, .. } => {
            sched.remove_booking(*id);
            owner.remove(id);
        }
        Event::UnavailabilityCreated { block } => {
            owner.insert(block.id, sched.id());
            sched.insert_block(block.clone());
        }
        Event::UnavailabilityDeleted { id, .. } => {
            sched.remove_block(*id);
            owner.remove(id);
        }
        Event::BarberCreated { .. }
        | Event::BarberDeleted { .. }
        | Event::ServiceSaved { .. }
        | Event::ServiceDeleted { .. }
        | Event::SettingsUpdated { .. } => {}
    }
    sched.version += 1;
}

/// Apply a reschedule that moves a booking to another barber.
fn apply_move(
    from: &mut BarberSchedule,
    to: &mut BarberSchedule,
    event: &Event,
    owner: &DashMap<Ulid, Ulid>,
) {
    let Event::BookingRescheduled { id, .. } = event else {
        return;
    };
    if let Some(mut booking) = from.remove_booking(*id) {
        apply_reschedule(&mut booking, event);
        owner.insert(*id, to.id());
        to.insert_booking(booking);
    }
    from.version += 1;
    to.version += 1;
}

/// The booking as it would look after `event`, for the exclusion check.
fn candidate_after(sched: &BarberSchedule, event: &Event) -> Option<Booking> {
    match event {
        Event::BookingCreated { booking } => Some(booking.clone()),
        Event::BookingRescheduled { id, .. } => sched.booking(*id).map(|b| {
            let mut b = b.clone();
            apply_reschedule(&mut b, event);
            b
        }),
        Event::BookingStatusChanged { id, status, .. } => sched.booking(*id).map(|b| Booking {
            status: *status,
            ..b.clone()
        }),
        _ => None,
    }
}

/// Storage-level exclusion constraint: no two active bookings of one barber
/// share time. Runs after the pre-check, right before the WAL append.
fn exclusion_backstop(target: &BarberSchedule, candidate: &Booking) -> Result<(), EngineError> {
    match target.exclusion_violation(candidate) {
        Some(other) => {
            tracing::warn!(booking = %candidate.id, %other, "exclusion constraint caught overlap");
            metrics::counter!(observability::CONFLICTS_TOTAL, "layer" => "exclusion", "occupant" => "booking")
                .increment(1);
            Err(EngineError::Conflict(Occupant::Booking(other)))
        }
        None => Ok(()),
    }
}

/// Barber id an event belongs to, for everything but roster and catalog events.
fn event_barber(event: &Event) -> Option<Ulid> {
    match event {
        Event::BarberUpdated { id, .. } => Some(*id),
        Event::BookingCreated { booking } => Some(booking.barber_id),
        Event::BookingStatusChanged { barber_id, .. }
        | Event::BookingDeleted { barber_id, .. }
        | Event::UnavailabilityDeleted { barber_id, .. } => Some(*barber_id),
        Event::UnavailabilityCreated { block } => Some(block.barber_id),
        Event::BookingRescheduled { from_barber, .. } => Some(*from_barber),
        Event::BarberCreated { .. }
        | Event::BarberDeleted { .. }
        | Event::ServiceSaved { .. }
        | Event::ServiceDeleted { .. }
        | Event::SettingsUpdated { .. } => None,
    }
}

/// Rebuilt state, owned outright until the engine wraps it in locks.
#[derive(Default)]
struct Recovered {
    schedules: HashMap<Ulid, BarberSchedule>,
    services: HashMap<Ulid, Service>,
    settings: BusinessSettings,
    owner: DashMap<Ulid, Ulid>,
}

impl Recovered {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::BarberCreated {
                id,
                name,
                is_active,
                created_at,
            } => {
                let barber = Barber {
                    id: *id,
                    name: name.clone(),
                    is_active: *is_active,
                    created_at: *created_at,
                };
                self.schedules.insert(*id, BarberSchedule::new(barber));
            }
            Event::BarberDeleted { id } => {
                self.schedules.remove(id);
            }
            Event::ServiceSaved { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
            }
            Event::SettingsUpdated { settings } => self.settings = settings.clone(),
            Event::BookingRescheduled {
                id,
                from_barber,
                to_barber,
                ..
            } if from_barber != to_barber => {
                let moved = self
                    .schedules
                    .get_mut(from_barber)
                    .and_then(|s| {
                        s.version += 1;
                        s.remove_booking(*id)
                    });
                if let (Some(mut booking), Some(to)) = (moved, self.schedules.get_mut(to_barber)) {
                    apply_reschedule(&mut booking, event);
                    self.owner.insert(*id, *to_barber);
                    to.insert_booking(booking);
                    to.version += 1;
                }
            }
            other => {
                if let Some(sched) = event_barber(other).and_then(|b| self.schedules.get_mut(&b)) {
                    apply_to_schedule(sched, other, &self.owner);
                }
            }
        }
    }
}

pub struct Engine {
    pub(super) barbers: DashMap<Ulid, SharedSchedule>,
    pub(super) services: RwLock<HashMap<Ulid, Service>>,
    pub(super) settings: RwLock<BusinessSettings>,
    /// Serializes barber creation and deletion against compaction.
    pub(super) roster: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Booking or block id → owning barber id.
    pub(super) owner: DashMap<Ulid, Ulid>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, replay) = Wal::open_with_replay(&wal_path)?;
        let mut recovered = Recovered::default();
        for event in &replay.events {
            recovered.apply(event);
        }
        tracing::info!(
            events = replay.events.len(),
            barbers = recovered.schedules.len(),
            services = recovered.services.len(),
            "replayed WAL from {}",
            wal_path.display()
        );
        metrics::gauge!(observability::BARBERS_LOADED).set(recovered.schedules.len() as f64);

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let barbers = recovered
            .schedules
            .into_iter()
            .map(|(id, s)| (id, Arc::new(RwLock::new(s))))
            .collect();
        Ok(Self {
            barbers,
            services: RwLock::new(recovered.services),
            settings: RwLock::new(recovered.settings),
            roster: Mutex::new(()),
            wal_tx,
            notify,
            owner: recovered.owner,
        })
    }

    /// Send an event to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn schedule(&self, barber_id: &Ulid) -> Option<SharedSchedule> {
        self.barbers.get(barber_id).map(|e| e.value().clone())
    }

    pub fn owner_of(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.owner.get(entity_id).map(|e| *e.value())
    }

    /// Write-lock a barber's schedule. Fails if the barber was deleted while
    /// we waited for the lock.
    pub(super) async fn lock_barber(
        &self,
        barber_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BarberSchedule>, EngineError> {
        let shared = self
            .schedule(&barber_id)
            .ok_or(EngineError::NotFound(barber_id))?;
        let guard = shared.clone().write_owned().await;
        let still_listed = self
            .barbers
            .get(&barber_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &shared));
        if !still_listed {
            return Err(EngineError::NotFound(barber_id));
        }
        Ok(guard)
    }

    /// Resolve an entity's barber, lock it, and confirm the entity is still
    /// there. A booking can move to another barber between lookup and lock;
    /// in that case the lookup is retried.
    pub(super) async fn lock_owner(
        &self,
        entity_id: Ulid,
        holds: impl Fn(&BarberSchedule) -> bool,
    ) -> Result<OwnedRwLockWriteGuard<BarberSchedule>, EngineError> {
        for _ in 0..3 {
            let barber_id = self
                .owner_of(&entity_id)
                .ok_or(EngineError::NotFound(entity_id))?;
            match self.lock_barber(barber_id).await {
                Ok(guard) if holds(&*guard) => return Ok(guard),
                Ok(_) | Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::NotFound(entity_id))
    }

    /// Exclusion check, WAL append, apply, notify. The caller holds the
    /// schedule's write lock across the whole call.
    pub(super) async fn persist_and_apply(
        &self,
        sched: &mut BarberSchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        if let Some(candidate) = candidate_after(sched, event) {
            exclusion_backstop(sched, &candidate)?;
        }
        self.wal_append(event).await?;
        apply_to_schedule(sched, event, &self.owner);
        self.notify.send(sched.id(), event);
        Ok(())
    }

    /// Same as [`Engine::persist_and_apply`] for a reschedule across barbers.
    /// Both schedules are write-locked by the caller.
    pub(super) async fn persist_and_apply_move(
        &self,
        from: &mut BarberSchedule,
        to: &mut BarberSchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        let Event::BookingRescheduled { id, .. } = event else {
            return Err(EngineError::WalError("not a reschedule".into()));
        };
        let candidate = candidate_after(from, event).ok_or(EngineError::NotFound(*id))?;
        exclusion_backstop(to, &candidate)?;
        self.wal_append(event).await?;
        apply_move(from, to, event, &self.owner);
        self.notify.send(from.id(), event);
        self.notify.send(to.id(), event);
        Ok(())
    }
}
