use std::sync::Arc;

use chrono::NaiveTime;
use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::time::now_ms;

use super::conflict::{check_block_clear, check_no_conflict, checked_span};
use super::error::Invalid;
use super::lifecycle::{transition, Action, Transition};
use super::{Engine, EngineError, WalCommand};

/// Arguments of `create_booking_safe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub barber_id: Ulid,
    pub service_id: Ulid,
    pub client_name: String,
    pub client_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub price: Decimal,
    pub notes: Option<String>,
}

/// Arguments of `update_booking_safe`. `None` keeps the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingUpdate {
    pub booking_id: Ulid,
    pub barber_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub client_name: Option<String>,
    pub service_id: Option<Ulid>,
}

fn checked_text(value: &str, max: usize, empty: Invalid, what: &'static str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(empty));
    }
    if trimmed.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(trimmed.to_string())
}

fn checked_optional(value: Option<String>, max: usize, what: &'static str) -> Result<Option<String>, EngineError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        other => Ok(other),
    }
}

fn checked_price(price: Decimal) -> Result<Decimal, EngineError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(EngineError::Validation(Invalid::NegativePrice));
    }
    Ok(price)
}

fn checked_duration(minutes: u32) -> Result<u32, EngineError> {
    if minutes == 0 {
        return Err(EngineError::Validation(Invalid::ZeroDuration));
    }
    if minutes > MAX_SERVICE_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("service duration too long"));
    }
    Ok(minutes)
}

fn precheck_conflict(
    sched: &BarberSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    check_no_conflict(sched, span, exclude).inspect_err(|e| {
        if let EngineError::Conflict(occupant) = e {
            tracing::debug!(barber = %sched.id(), occupant = %occupant.id(), kind = occupant.kind(), "slot taken");
            metrics::counter!(observability::CONFLICTS_TOTAL, "layer" => "precheck", "occupant" => occupant.kind())
                .increment(1);
        }
    })
}

fn lifecycle(id: Ulid, from: Option<BookingStatus>, action: Action) -> Result<Transition, EngineError> {
    transition(from, action).map_err(|illegal| {
        tracing::debug!(booking = %id, ?from, %action, "illegal transition");
        metrics::counter!(observability::ILLEGAL_TRANSITIONS_TOTAL, "action" => action.as_str())
            .increment(1);
        EngineError::IllegalTransition {
            id,
            from: illegal.from,
            action: illegal.action,
        }
    })
}

impl Engine {
    // ── Roster ───────────────────────────────────────────

    pub async fn create_barber(&self, name: &str, is_active: bool) -> Result<Barber, EngineError> {
        let name = checked_text(name, MAX_NAME_LEN, Invalid::EmptyName, "barber name too long")?;
        let _roster = self.roster.lock().await;
        if self.barbers.len() >= MAX_BARBERS {
            return Err(EngineError::LimitExceeded("too many barbers"));
        }
        let barber = Barber {
            id: Ulid::new(),
            name,
            is_active,
            created_at: now_ms(),
        };
        let event = Event::BarberCreated {
            id: barber.id,
            name: barber.name.clone(),
            is_active,
            created_at: barber.created_at,
        };
        self.wal_append(&event).await?;
        self.barbers.insert(
            barber.id,
            Arc::new(RwLock::new(BarberSchedule::new(barber.clone()))),
        );
        metrics::gauge!(observability::BARBERS_LOADED).set(self.barbers.len() as f64);
        tracing::info!(barber = %barber.id, name = %barber.name, "barber created");
        Ok(barber)
    }

    /// Activation only changes visibility in scheduling views.
    pub async fn set_barber_active(&self, barber_id: Ulid, is_active: bool) -> Result<Barber, EngineError> {
        let mut guard = self.lock_barber(barber_id).await?;
        let event = Event::BarberUpdated {
            id: barber_id,
            name: guard.barber.name.clone(),
            is_active,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.barber.clone())
    }

    /// Hard delete, allowed only while no booking of any status references the barber.
    pub async fn delete_barber(&self, barber_id: Ulid) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        let guard = self.lock_barber(barber_id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(barber_id));
        }
        let event = Event::BarberDeleted { id: barber_id };
        self.wal_append(&event).await?;
        for block in &guard.blocks {
            self.owner.remove(&block.id);
        }
        self.barbers.remove(&barber_id);
        drop(guard);
        self.notify.send(barber_id, &event);
        self.notify.remove(&barber_id);
        metrics::gauge!(observability::BARBERS_LOADED).set(self.barbers.len() as f64);
        tracing::info!(barber = %barber_id, "barber deleted");
        Ok(())
    }

    // ── Catalog ──────────────────────────────────────────

    pub async fn create_service(
        &self,
        name: &str,
        duration_minutes: u32,
        price: Decimal,
    ) -> Result<Service, EngineError> {
        let service = Service {
            id: Ulid::new(),
            name: checked_text(name, MAX_NAME_LEN, Invalid::EmptyName, "service name too long")?,
            duration_minutes: checked_duration(duration_minutes)?,
            price: checked_price(price)?,
            is_active: true,
        };
        let mut services = self.services.write().await;
        if services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.wal_append(&Event::ServiceSaved { service: service.clone() }).await?;
        services.insert(service.id, service.clone());
        Ok(service)
    }

    /// Deactivation is the soft delete. Bookings keep the price and duration
    /// they were made with.
    pub async fn update_service(
        &self,
        service_id: Ulid,
        name: &str,
        duration_minutes: u32,
        price: Decimal,
        is_active: bool,
    ) -> Result<Service, EngineError> {
        let service = Service {
            id: service_id,
            name: checked_text(name, MAX_NAME_LEN, Invalid::EmptyName, "service name too long")?,
            duration_minutes: checked_duration(duration_minutes)?,
            price: checked_price(price)?,
            is_active,
        };
        let mut services = self.services.write().await;
        if !services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        self.wal_append(&Event::ServiceSaved { service: service.clone() }).await?;
        services.insert(service_id, service.clone());
        Ok(service)
    }

    /// Hard delete, allowed only while no booking of any status references
    /// the service. Every barber is read-locked so no booking can pick the
    /// service up while the scan runs.
    pub async fn delete_service(&self, service_id: Ulid) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        let mut ids: Vec<Ulid> = self.barbers.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.schedule(&id) {
                schedules.push(shared.read_owned().await);
            }
        }
        let mut services = self.services.write().await;
        if !services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        let referenced = schedules
            .iter()
            .any(|s| s.bookings.iter().any(|b| b.service_id == Some(service_id)));
        if referenced {
            return Err(EngineError::ServiceInUse(service_id));
        }
        self.wal_append(&Event::ServiceDeleted { id: service_id }).await?;
        services.remove(&service_id);
        tracing::info!(service = %service_id, "service deleted");
        Ok(())
    }

    pub async fn update_settings(
        &self,
        opening_time: NaiveTime,
        closing_time: NaiveTime,
        slot_interval: u32,
    ) -> Result<BusinessSettings, EngineError> {
        let slot_interval = SlotInterval::from_minutes(slot_interval)
            .ok_or(EngineError::Validation(Invalid::SlotInterval(slot_interval)))?;
        if opening_time >= closing_time {
            return Err(EngineError::Validation(Invalid::BusinessHours));
        }
        let settings = BusinessSettings {
            opening_time,
            closing_time,
            slot_interval,
        };
        let mut current = self.settings.write().await;
        self.wal_append(&Event::SettingsUpdated { settings: settings.clone() }).await?;
        *current = settings.clone();
        Ok(settings)
    }

    async fn check_service_exists(&self, service_id: Option<Ulid>) -> Result<(), EngineError> {
        match service_id {
            Some(id) if !self.services.read().await.contains_key(&id) => Err(EngineError::NotFound(id)),
            _ => Ok(()),
        }
    }

    // ── Bookings ─────────────────────────────────────────

    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        let span = checked_span(new.start, new.end, MAX_BOOKING_SPAN_MS)?;
        let client_name = checked_text(
            &new.client_name,
            MAX_CLIENT_NAME_LEN,
            Invalid::EmptyClientName,
            "client name too long",
        )?;
        let notes = checked_optional(new.notes, MAX_NOTES_LEN, "notes too long")?;
        let price = checked_price(new.price)?;

        let mut guard = self.lock_barber(new.barber_id).await?;
        if !guard.barber.is_active {
            return Err(EngineError::Validation(Invalid::InactiveBarber(new.barber_id)));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_BARBER {
            return Err(EngineError::LimitExceeded("too many bookings for barber"));
        }
        self.check_service_exists(Some(new.service_id)).await?;
        precheck_conflict(&guard, &span, None)?;

        let booking = Booking {
            id: Ulid::new(),
            barber_id: new.barber_id,
            service_id: Some(new.service_id),
            client_name,
            client_id: new.client_id,
            span,
            duration_minutes: span.duration_minutes() as u32,
            price_at_booking: price,
            status: BookingStatus::Scheduled,
            notes,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &Event::BookingCreated { booking: booking.clone() })
            .await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => Action::Create.as_str()).increment(1);
        tracing::info!(booking = %booking.id, barber = %booking.barber_id, "booking created");
        Ok(booking)
    }

    /// Move and/or edit a booking, possibly onto another barber. Barber, span,
    /// client name and service change together or not at all.
    pub async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, EngineError> {
        let span = checked_span(update.start, update.end, MAX_BOOKING_SPAN_MS)?;
        let client_name = checked_optional(update.client_name, MAX_CLIENT_NAME_LEN, "client name too long")?;
        let id = update.booking_id;

        for _ in 0..3 {
            let from_barber = self.owner_of(&id).ok_or(EngineError::NotFound(id))?;
            let result = if from_barber == update.barber_id {
                self.reschedule_in_place(id, from_barber, span, client_name.clone(), update.service_id)
                    .await
            } else {
                self.reschedule_across(id, from_barber, update.barber_id, span, client_name.clone(), update.service_id)
                    .await
            };
            match result {
                // The booking moved between lookup and lock; resolve again.
                Err(Moved) => continue,
                Ok(Ok(booking)) => return Ok(booking),
                Ok(Err(e)) => return Err(e),
            }
        }
        Err(EngineError::NotFound(id))
    }

    async fn reschedule_in_place(
        &self,
        id: Ulid,
        barber_id: Ulid,
        span: Span,
        client_name: Option<String>,
        service_id: Option<Ulid>,
    ) -> Result<Result<Booking, EngineError>, Moved> {
        let mut guard = match self.lock_barber(barber_id).await {
            Ok(g) => g,
            Err(_) => return Err(Moved),
        };
        let Some(current) = guard.booking(id).cloned() else {
            return Err(Moved);
        };
        Ok(self.commit_reschedule(&mut guard, None, current, span, client_name, service_id).await)
    }

    async fn reschedule_across(
        &self,
        id: Ulid,
        from_barber: Ulid,
        to_barber: Ulid,
        span: Span,
        client_name: Option<String>,
        service_id: Option<Ulid>,
    ) -> Result<Result<Booking, EngineError>, Moved> {
        if self.schedule(&to_barber).is_none() {
            return Ok(Err(EngineError::NotFound(to_barber)));
        }
        // Two locks, always in id order.
        let (first, second) = if from_barber < to_barber {
            (from_barber, to_barber)
        } else {
            (to_barber, from_barber)
        };
        let first_guard = match self.lock_barber(first).await {
            Ok(g) => g,
            Err(e) if first == to_barber => return Ok(Err(e)),
            Err(_) => return Err(Moved),
        };
        let second_guard = match self.lock_barber(second).await {
            Ok(g) => g,
            Err(e) if second == to_barber => return Ok(Err(e)),
            Err(_) => return Err(Moved),
        };
        let (mut from, mut to) = if first == from_barber {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };
        let Some(current) = from.booking(id).cloned() else {
            return Err(Moved);
        };
        if !to.barber.is_active {
            return Ok(Err(EngineError::Validation(Invalid::InactiveBarber(to_barber))));
        }
        if to.bookings.len() >= MAX_BOOKINGS_PER_BARBER {
            return Ok(Err(EngineError::LimitExceeded("too many bookings for barber")));
        }
        Ok(self
            .commit_reschedule(&mut to, Some(&mut *from), current, span, client_name, service_id)
            .await)
    }

    /// `target` is the barber the booking ends up with; `source` is set when
    /// that differs from the current barber.
    async fn commit_reschedule(
        &self,
        target: &mut BarberSchedule,
        source: Option<&mut BarberSchedule>,
        current: Booking,
        span: Span,
        client_name: Option<String>,
        service_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        lifecycle(current.id, Some(current.status), Action::Reschedule)?;
        self.check_service_exists(service_id).await?;
        // A no-op move still runs the check; self-exclusion makes it pass.
        precheck_conflict(target, &span, Some(current.id))?;

        let event = Event::BookingRescheduled {
            id: current.id,
            from_barber: current.barber_id,
            to_barber: target.id(),
            span,
            duration_minutes: span.duration_minutes() as u32,
            client_name: client_name.unwrap_or_else(|| current.client_name.clone()),
            service_id: service_id.or(current.service_id),
        };
        match source {
            Some(from) => self.persist_and_apply_move(from, target, &event).await?,
            None => self.persist_and_apply(target, &event).await?,
        }
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => Action::Reschedule.as_str())
            .increment(1);
        tracing::info!(booking = %current.id, from = %current.barber_id, to = %target.id(), "booking rescheduled");
        target
            .booking(current.id)
            .cloned()
            .ok_or(EngineError::NotFound(current.id))
    }

    pub async fn start_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, Action::Start).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, Action::Complete).await
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, Action::Cancel).await
    }

    /// Status-only transitions: start, complete, cancel.
    pub async fn transition_booking(&self, id: Ulid, action: Action) -> Result<Booking, EngineError> {
        let mut guard = self.lock_owner(id, |s| s.booking(id).is_some()).await?;
        let from = guard.booking(id).map(|b| b.status);
        let status = match lifecycle(id, from, action)? {
            Transition::To(status) if matches!(action, Action::Start | Action::Complete | Action::Cancel) => status,
            _ => {
                return Err(EngineError::IllegalTransition { id, from, action });
            }
        };
        let event = Event::BookingStatusChanged {
            id,
            barber_id: guard.id(),
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => action.as_str()).increment(1);
        tracing::info!(booking = %id, %status, "booking {action}");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Hard delete from any status.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.lock_owner(id, |s| s.booking(id).is_some()).await?;
        let current = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        lifecycle(id, Some(current.status), Action::Delete)?;
        let event = Event::BookingDeleted {
            id,
            barber_id: guard.id(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => Action::Delete.as_str()).increment(1);
        tracing::info!(booking = %id, status = %current.status, "booking deleted");
        Ok(current)
    }

    // ── Unavailability ───────────────────────────────────

    pub async fn create_unavailability(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, EngineError> {
        let span = checked_span(start, end, MAX_BLOCK_SPAN_MS)?;
        let reason = checked_optional(reason, MAX_REASON_LEN, "reason too long")?;
        let mut guard = self.lock_barber(barber_id).await?;
        if guard.blocks.len() >= MAX_BLOCKS_PER_BARBER {
            return Err(EngineError::LimitExceeded("too many unavailability blocks for barber"));
        }
        check_block_clear(&guard, &span).inspect_err(|_| {
            metrics::counter!(observability::CONFLICTS_TOTAL, "layer" => "precheck", "occupant" => "booking")
                .increment(1);
        })?;
        let block = UnavailabilityBlock {
            id: Ulid::new(),
            barber_id,
            span,
            reason,
        };
        self.persist_and_apply(&mut guard, &Event::UnavailabilityCreated { block: block.clone() })
            .await?;
        tracing::info!(block = %block.id, barber = %barber_id, "unavailability created");
        Ok(block)
    }

    pub async fn delete_unavailability(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self
            .lock_owner(id, |s| s.blocks.iter().any(|b| b.id == id))
            .await?;
        let event = Event::UnavailabilityDeleted {
            id,
            barber_id: guard.id(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state. Every
    /// writer is held off while the snapshot is taken and swapped in, so no
    /// append can land in the log being replaced.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _roster = self.roster.lock().await;
        let mut ids: Vec<Ulid> = self.barbers.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.schedule(&id) {
                schedules.push(shared.read_owned().await);
            }
        }
        let services = self.services.read().await;
        let settings = self.settings.read().await;

        let mut events = vec![Event::SettingsUpdated {
            settings: settings.clone(),
        }];
        let mut catalog: Vec<&Service> = services.values().collect();
        catalog.sort_by_key(|s| s.id);
        events.extend(catalog.into_iter().map(|s| Event::ServiceSaved { service: s.clone() }));
        for sched in &schedules {
            let b = &sched.barber;
            events.push(Event::BarberCreated {
                id: b.id,
                name: b.name.clone(),
                is_active: b.is_active,
                created_at: b.created_at,
            });
            events.extend(sched.bookings.iter().map(|booking| Event::BookingCreated {
                booking: booking.clone(),
            }));
            events.extend(sched.blocks.iter().map(|block| Event::UnavailabilityCreated {
                block: block.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => status).increment(1);
        if result.is_ok() {
            tracing::info!(events = count, "WAL compacted");
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The booking left its barber between lookup and lock.
struct Moved;
