use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{checked_span, detect};
use super::{Engine, EngineError};

fn check_window(window: &Span) -> Result<(), EngineError> {
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Sorted by name.
    pub async fn list_barbers(&self, active_only: bool) -> Vec<Barber> {
        let shared: Vec<_> = self.barbers.iter().map(|e| e.value().clone()).collect();
        let mut barbers = Vec::with_capacity(shared.len());
        for sched in shared {
            let guard = sched.read().await;
            if !active_only || guard.barber.is_active {
                barbers.push(guard.barber.clone());
            }
        }
        barbers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        barbers
    }

    pub async fn get_barber(&self, id: Ulid) -> Result<Barber, EngineError> {
        let sched = self.schedule(&id).ok_or(EngineError::NotFound(id))?;
        let guard = sched.read().await;
        Ok(guard.barber.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        // One retry covers a booking that moved barbers mid-lookup.
        for _ in 0..2 {
            let barber_id = self.owner_of(&id).ok_or(EngineError::NotFound(id))?;
            if let Some(sched) = self.schedule(&barber_id)
                && let Some(b) = sched.read().await.booking(id)
            {
                return Ok(b.clone());
            }
        }
        Err(EngineError::NotFound(id))
    }

    /// Bookings of every status whose start falls in `window`, ordered by start.
    pub async fn bookings_in_range(
        &self,
        window: Span,
        barber_id: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        check_window(&window)?;
        let mut out = Vec::new();
        for sched in self.schedules_for(barber_id)? {
            let guard = sched.read().await;
            let from = guard.bookings.partition_point(|b| b.span.start < window.start);
            let to = guard.bookings.partition_point(|b| b.span.start < window.end);
            out.extend_from_slice(&guard.bookings[from..to]);
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Blocks that overlap `window`, so multi-day blocks show on every day they cover.
    pub async fn unavailability_in_range(
        &self,
        window: Span,
        barber_id: Option<Ulid>,
    ) -> Result<Vec<UnavailabilityBlock>, EngineError> {
        check_window(&window)?;
        let mut out = Vec::new();
        for sched in self.schedules_for(barber_id)? {
            let guard = sched.read().await;
            out.extend(guard.overlapping_blocks(&window).cloned());
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        Ok(out)
    }

    /// Sorted by name.
    pub async fn list_services(&self, active_only: bool) -> Vec<Service> {
        let services = self.services.read().await;
        let mut out: Vec<Service> = services
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn settings(&self) -> BusinessSettings {
        self.settings.read().await.clone()
    }

    /// Read-only conflict check. The answer is only as fresh as the read lock.
    pub async fn check_conflict(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Option<Occupant>, EngineError> {
        let span = checked_span(start, end, MAX_BLOCK_SPAN_MS)?;
        let sched = self
            .schedule(&barber_id)
            .ok_or(EngineError::NotFound(barber_id))?;
        let guard = sched.read().await;
        Ok(detect(
            guard.overlapping_bookings(&span),
            guard.overlapping_blocks(&span),
            &span,
            exclude,
        ))
    }

    fn schedules_for(&self, barber_id: Option<Ulid>) -> Result<Vec<super::SharedSchedule>, EngineError> {
        match barber_id {
            Some(id) => Ok(vec![self.schedule(&id).ok_or(EngineError::NotFound(id))?]),
            None => Ok(self.barbers.iter().map(|e| e.value().clone()).collect()),
        }
    }
}
