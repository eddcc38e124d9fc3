//! Client-side agenda: the cached day view, the advisory shadow check,
//! per-entity re-entrancy guards and optimistic drag handling.
//!
//! Nothing here is authoritative. Every mutation still goes through a
//! [`Scheduler`], and the snapshot is refetched after each success.

mod inflight;
mod optimistic;
mod shadow;

pub use inflight::{InFlight, InFlightGuard};
pub use optimistic::Optimistic;
pub use shadow::{Advice, Snapshot};

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{
    allowed_actions, Action, BookingUpdate, Engine, EngineError, ErrorKind, Invalid, NewBooking,
};
use crate::model::*;
use crate::time::{normalize_to_minute, BusinessZone};

/// How a remote call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The server refused; retrying the same input fails the same way.
    Rejected(EngineError),
    /// The outcome is unknown. Refetch before trusting the snapshot.
    Transport(String),
}

impl From<EngineError> for CallError {
    fn from(e: EngineError) -> Self {
        match e {
            // A failed durable write looks like a lost call from out here.
            EngineError::WalError(msg) => CallError::Transport(msg),
            other => CallError::Rejected(other),
        }
    }
}

/// The remote procedures and reads the agenda needs.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn list_barbers(&self, active_only: bool) -> Result<Vec<Barber>, CallError>;
    async fn list_services(&self, active_only: bool) -> Result<Vec<Service>, CallError>;
    async fn settings(&self) -> Result<BusinessSettings, CallError>;
    async fn bookings_in_range(&self, window: Span) -> Result<Vec<Booking>, CallError>;
    async fn unavailability_in_range(&self, window: Span) -> Result<Vec<UnavailabilityBlock>, CallError>;
    async fn create_booking(&self, new: NewBooking) -> Result<Booking, CallError>;
    async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, CallError>;
    async fn transition_booking(&self, id: Ulid, action: Action) -> Result<Booking, CallError>;
    async fn delete_booking(&self, id: Ulid) -> Result<(), CallError>;
    async fn create_unavailability(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, CallError>;
}

#[async_trait]
impl Scheduler for Engine {
    async fn list_barbers(&self, active_only: bool) -> Result<Vec<Barber>, CallError> {
        Ok(Engine::list_barbers(self, active_only).await)
    }

    async fn list_services(&self, active_only: bool) -> Result<Vec<Service>, CallError> {
        Ok(Engine::list_services(self, active_only).await)
    }

    async fn settings(&self) -> Result<BusinessSettings, CallError> {
        Ok(Engine::settings(self).await)
    }

    async fn bookings_in_range(&self, window: Span) -> Result<Vec<Booking>, CallError> {
        Ok(Engine::bookings_in_range(self, window, None).await?)
    }

    async fn unavailability_in_range(&self, window: Span) -> Result<Vec<UnavailabilityBlock>, CallError> {
        Ok(Engine::unavailability_in_range(self, window, None).await?)
    }

    async fn create_booking(&self, new: NewBooking) -> Result<Booking, CallError> {
        Ok(Engine::create_booking(self, new).await?)
    }

    async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, CallError> {
        Ok(Engine::update_booking(self, update).await?)
    }

    async fn transition_booking(&self, id: Ulid, action: Action) -> Result<Booking, CallError> {
        Ok(Engine::transition_booking(self, id, action).await?)
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), CallError> {
        Engine::delete_booking(self, id).await?;
        Ok(())
    }

    async fn create_unavailability(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, CallError> {
        Ok(Engine::create_unavailability(self, barber_id, start, end, reason).await?)
    }
}

#[async_trait]
impl<T: Scheduler + ?Sized> Scheduler for Arc<T> {
    async fn list_barbers(&self, active_only: bool) -> Result<Vec<Barber>, CallError> {
        (**self).list_barbers(active_only).await
    }

    async fn list_services(&self, active_only: bool) -> Result<Vec<Service>, CallError> {
        (**self).list_services(active_only).await
    }

    async fn settings(&self) -> Result<BusinessSettings, CallError> {
        (**self).settings().await
    }

    async fn bookings_in_range(&self, window: Span) -> Result<Vec<Booking>, CallError> {
        (**self).bookings_in_range(window).await
    }

    async fn unavailability_in_range(&self, window: Span) -> Result<Vec<UnavailabilityBlock>, CallError> {
        (**self).unavailability_in_range(window).await
    }

    async fn create_booking(&self, new: NewBooking) -> Result<Booking, CallError> {
        (**self).create_booking(new).await
    }

    async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, CallError> {
        (**self).update_booking(update).await
    }

    async fn transition_booking(&self, id: Ulid, action: Action) -> Result<Booking, CallError> {
        (**self).transition_booking(id, action).await
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), CallError> {
        (**self).delete_booking(id).await
    }

    async fn create_unavailability(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, CallError> {
        (**self).create_unavailability(barber_id, start, end, reason).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgendaError {
    /// Another operation on the same entity is still outstanding.
    Busy { id: Ulid, op: &'static str },
    /// The snapshot already shows the slot taken; nothing was sent.
    Doomed(Occupant),
    /// The booking's status does not offer this action; nothing was sent.
    Gated {
        id: Ulid,
        status: BookingStatus,
        action: Action,
    },
    /// Deleting a closed booking needs an explicit confirmation.
    NeedsConfirmation(Ulid),
    /// Not in the current snapshot.
    UnknownBooking(Ulid),
    Transport(String),
    Rejected(EngineError),
}

impl From<CallError> for AgendaError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Rejected(e) => AgendaError::Rejected(e),
            CallError::Transport(msg) => AgendaError::Transport(msg),
        }
    }
}

fn occupant_message(occupant: &Occupant) -> &'static str {
    match occupant {
        Occupant::Booking(_) => "That time is already taken. Pick another slot.",
        Occupant::Unavailability(_) => "The barber is unavailable at that time.",
    }
}

impl AgendaError {
    /// Copy for the person at the front desk.
    pub fn user_message(&self) -> String {
        match self {
            AgendaError::Busy { .. } => "This appointment is still being saved. Try again in a moment.".into(),
            AgendaError::Doomed(occupant) => occupant_message(occupant).into(),
            AgendaError::Gated { status, action, .. } => {
                format!("A {} appointment cannot be {}.", status.as_str().replace('_', " "), past_tense(*action))
            }
            AgendaError::NeedsConfirmation(_) => {
                "This appointment is already closed. Confirm to delete it permanently.".into()
            }
            AgendaError::UnknownBooking(_) => "This appointment no longer exists. The agenda was reloaded.".into(),
            AgendaError::Transport(_) => "Connection problem. The change may not have been saved; reloading.".into(),
            AgendaError::Rejected(e) => match e {
                EngineError::Conflict(occupant) => occupant_message(occupant).into(),
                EngineError::Validation(Invalid::InactiveBarber(_)) => {
                    "This barber is not taking appointments right now.".into()
                }
                EngineError::ServiceInUse(_) => {
                    "This service has appointments. Deactivate it instead of deleting.".into()
                }
                EngineError::Validation(reason) => format!("Please check the form: {reason}."),
                other => match other.kind() {
                    ErrorKind::BlockedByBookings => {
                        "There are appointments in that period. Move or cancel them first.".into()
                    }
                    ErrorKind::NotFound => "This appointment no longer exists. The agenda was reloaded.".into(),
                    ErrorKind::IllegalTransition => "This appointment can no longer be changed that way.".into(),
                    ErrorKind::Forbidden => "This barber has appointments. Deactivate instead of deleting.".into(),
                    ErrorKind::LimitExceeded => "That request is too large.".into(),
                    _ => "Something went wrong. Please try again.".into(),
                },
            },
        }
    }
}

fn past_tense(action: Action) -> &'static str {
    match action {
        Action::Create => "created",
        Action::Start => "started",
        Action::Complete => "completed",
        Action::Cancel => "cancelled",
        Action::Reschedule => "moved",
        Action::Delete => "deleted",
    }
}

impl std::fmt::Display for AgendaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgendaError::Busy { id, op } => write!(f, "{id} busy with {op}"),
            AgendaError::Doomed(occ) => write!(f, "slot taken by {} {}", occ.kind(), occ.id()),
            AgendaError::Gated { id, status, action } => {
                write!(f, "{action} not offered for {id} in status {status}")
            }
            AgendaError::NeedsConfirmation(id) => write!(f, "deleting {id} needs confirmation"),
            AgendaError::UnknownBooking(id) => write!(f, "booking {id} not in snapshot"),
            AgendaError::Transport(msg) => write!(f, "transport error: {msg}"),
            AgendaError::Rejected(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AgendaError {}

fn advise(advice: Advice) -> Result<(), AgendaError> {
    match advice {
        Advice::Clear => Ok(()),
        Advice::Doomed(occupant) => Err(AgendaError::Doomed(occupant)),
    }
}

/// Minute-aligned span, or `None` when empty so the server reports it.
fn local_span(start: Ms, end: Ms) -> Option<Span> {
    let (start, end) = (normalize_to_minute(start), normalize_to_minute(end));
    (start < end).then(|| Span::new(start, end))
}

pub struct Agenda<S> {
    scheduler: S,
    zone: BusinessZone,
    snapshot: Mutex<Snapshot>,
    inflight: InFlight,
}

impl<S: Scheduler> Agenda<S> {
    /// Starts stale; call [`Agenda::refresh`] or [`Agenda::view`] to load.
    pub fn new(scheduler: S, zone: BusinessZone, day: NaiveDate) -> Result<Self, AgendaError> {
        let window = day_window(&zone, day)?;
        Ok(Self {
            scheduler,
            zone,
            snapshot: Mutex::new(Snapshot::empty(day, window)),
            inflight: InFlight::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    pub fn zone(&self) -> BusinessZone {
        self.zone
    }

    /// The snapshot, refetched first if it is stale.
    pub async fn view(&self) -> Result<Snapshot, AgendaError> {
        if self.lock().stale {
            self.refresh().await?;
        }
        Ok(self.snapshot())
    }

    /// Navigate to another local day and load it.
    pub async fn set_day(&self, day: NaiveDate) -> Result<(), AgendaError> {
        let window = day_window(&self.zone, day)?;
        *self.lock() = Snapshot::empty(day, window);
        self.refresh().await
    }

    /// Refetch the current day. Bookings with an operation in flight keep
    /// their local version until that operation settles.
    pub async fn refresh(&self) -> Result<(), AgendaError> {
        let (day, window) = {
            let s = self.lock();
            (s.day, s.window)
        };
        let fetched = async {
            Ok::<_, CallError>((
                self.scheduler.list_barbers(true).await?,
                self.scheduler.list_services(true).await?,
                self.scheduler.bookings_in_range(window).await?,
                self.scheduler.unavailability_in_range(window).await?,
                self.scheduler.settings().await?,
            ))
        }
        .await;

        let mut s = self.lock();
        let (barbers, services, bookings, blocks, settings) = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                s.stale = true;
                return Err(e.into());
            }
        };
        if s.day != day {
            // Navigated away while fetching.
            return Ok(());
        }
        let held: Vec<Booking> = s
            .bookings
            .iter()
            .filter(|b| self.inflight.is_busy(&b.id))
            .cloned()
            .collect();
        *s = Snapshot {
            day,
            window,
            barbers,
            services,
            bookings,
            blocks,
            settings,
            stale: false,
        };
        for b in held {
            s.put_booking(b);
        }
        Ok(())
    }

    /// Grid start instants for the current day.
    pub fn slots(&self) -> Vec<Ms> {
        let s = self.lock();
        s.settings
            .slots()
            .into_iter()
            .filter_map(|t| self.zone.to_utc(s.day.and_time(t)).ok())
            .collect()
    }

    pub fn shadow_check(&self, barber_id: Ulid, span: &Span, exclude: Option<Ulid>) -> Advice {
        self.lock().shadow_check(barber_id, span, exclude)
    }

    fn claim(&self, id: Ulid, op: &'static str) -> Result<InFlightGuard, AgendaError> {
        self.inflight.try_begin(id, op).map_err(|held| {
            tracing::debug!(%id, op, held, "refused re-entrant operation");
            AgendaError::Busy { id, op: held }
        })
    }

    fn current(&self, id: Ulid) -> Result<Booking, AgendaError> {
        self.lock().booking(id).cloned().ok_or(AgendaError::UnknownBooking(id))
    }

    /// Common tail of every call: refetch on success, mark stale when the
    /// outcome is unknown or the row vanished.
    async fn settle<T>(&self, result: Result<T, CallError>) -> Result<T, AgendaError> {
        match result {
            Ok(value) => {
                if let Err(e) = self.refresh().await {
                    tracing::warn!("refresh after mutation failed: {e}");
                }
                Ok(value)
            }
            Err(e) => {
                if matches!(&e, CallError::Transport(_) | CallError::Rejected(EngineError::NotFound(_))) {
                    self.lock().stale = true;
                }
                Err(e.into())
            }
        }
    }

    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, AgendaError> {
        let guard = self.claim(new.barber_id, "create")?;
        if let Some(span) = local_span(new.start, new.end) {
            advise(self.shadow_check(new.barber_id, &span, None))?;
        }
        let result = self.scheduler.create_booking(new).await;
        if let Ok(b) = &result {
            self.lock().put_booking(b.clone());
        }
        drop(guard);
        self.settle(result).await
    }

    /// Drag and drop: same duration, new start, possibly another barber.
    pub async fn move_booking(&self, id: Ulid, to_barber: Ulid, start: Ms) -> Result<Booking, AgendaError> {
        let prior = self.current(id)?;
        let start = normalize_to_minute(start);
        let update = BookingUpdate {
            booking_id: id,
            barber_id: to_barber,
            start,
            end: start + prior.span.duration_ms(),
            client_name: None,
            service_id: None,
        };
        self.reschedule(update).await
    }

    /// Edit from the appointment form. Applied optimistically like a drag.
    pub async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, AgendaError> {
        self.reschedule(update).await
    }

    async fn reschedule(&self, update: BookingUpdate) -> Result<Booking, AgendaError> {
        let id = update.booking_id;
        let guard = self.claim(id, "reschedule")?;
        let prior = self.current(id)?;
        gate(&prior, Action::Reschedule)?;

        let mut local = prior.clone();
        if let Some(span) = local_span(update.start, update.end) {
            advise(self.shadow_check(update.barber_id, &span, Some(id)))?;
            local.span = span;
            local.duration_minutes = span.duration_minutes() as u32;
        }
        local.barber_id = update.barber_id;
        if let Some(name) = update.client_name.as_ref().filter(|n| !n.trim().is_empty()) {
            local.client_name = name.trim().to_string();
        }
        if update.service_id.is_some() {
            local.service_id = update.service_id;
        }

        let pending = Optimistic::pending(prior, local.clone());
        self.lock().put_booking(local);

        let result = self.scheduler.update_booking(update).await;
        let settled = pending.reconcile(result.clone());
        if let Optimistic::Reverted(prior) = &settled {
            tracing::debug!(booking = %prior.id, "reverting optimistic move");
        }
        self.lock().put_booking(settled.into_shown());
        drop(guard);
        self.settle(result).await
    }

    /// Start, complete or cancel. Actions the status does not offer are
    /// refused without a call.
    pub async fn transition(&self, id: Ulid, action: Action) -> Result<Booking, AgendaError> {
        let guard = self.claim(id, action.as_str())?;
        let current = self.current(id)?;
        if !matches!(action, Action::Start | Action::Complete | Action::Cancel) {
            return Err(AgendaError::Gated {
                id,
                status: current.status,
                action,
            });
        }
        gate(&current, action)?;
        let result = self.scheduler.transition_booking(id, action).await;
        if let Ok(b) = &result {
            self.lock().put_booking(b.clone());
        }
        drop(guard);
        self.settle(result).await
    }

    /// Completed and cancelled bookings are history; removing one needs `confirmed`.
    pub async fn delete_booking(&self, id: Ulid, confirmed: bool) -> Result<(), AgendaError> {
        let guard = self.claim(id, "delete")?;
        let current = self.current(id)?;
        if current.status.is_terminal() && !confirmed {
            return Err(AgendaError::NeedsConfirmation(id));
        }
        let result = self.scheduler.delete_booking(id).await;
        if result.is_ok() {
            self.lock().remove_booking(id);
        }
        drop(guard);
        self.settle(result).await
    }

    pub async fn block_time(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, AgendaError> {
        let guard = self.claim(barber_id, "block")?;
        if let Some(span) = local_span(start, end) {
            advise(self.lock().shadow_check_block(barber_id, &span))?;
        }
        let result = self.scheduler.create_unavailability(barber_id, start, end, reason).await;
        drop(guard);
        self.settle(result).await
    }
}

fn gate(booking: &Booking, action: Action) -> Result<(), AgendaError> {
    if allowed_actions(booking.status).contains(&action) {
        Ok(())
    } else {
        Err(AgendaError::Gated {
            id: booking.id,
            status: booking.status,
            action,
        })
    }
}

fn day_window(zone: &BusinessZone, day: NaiveDate) -> Result<Span, AgendaError> {
    zone.day_bounds(day)
        .map_err(|_| AgendaError::Rejected(EngineError::LimitExceeded("date out of range")))
}

#[cfg(test)]
mod tests;
