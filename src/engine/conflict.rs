use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::normalize_to_minute;

use super::error::Invalid;
use super::EngineError;

/// Truncate both ends to the minute, then validate the range. Every span that
/// reaches a booking or a block comes through here.
pub(crate) fn checked_span(start: Ms, end: Ms, max_len: Ms) -> Result<Span, EngineError> {
    let (start, end) = (normalize_to_minute(start), normalize_to_minute(end));
    if end <= start {
        return Err(EngineError::Validation(Invalid::EmptyRange { start, end }));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > max_len {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// First occupant of `span`: an active booking other than `exclude`, else a
/// block. Completed and cancelled bookings never occupy.
pub fn detect<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    blocks: impl IntoIterator<Item = &'a UnavailabilityBlock>,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Occupant> {
    bookings
        .into_iter()
        .find(|b| Some(b.id) != exclude && b.occupies(span))
        .map(|b| Occupant::Booking(b.id))
        .or_else(|| {
            blocks
                .into_iter()
                .find(|u| u.span.overlaps(span))
                .map(|u| Occupant::Unavailability(u.id))
        })
}

/// Conflict check against one barber, using the schedule's index to prune.
pub(crate) fn check_no_conflict(
    schedule: &BarberSchedule,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match detect(
        schedule.overlapping_bookings(span),
        schedule.overlapping_blocks(span),
        span,
        exclude,
    ) {
        Some(occupant) => Err(EngineError::Conflict(occupant)),
        None => Ok(()),
    }
}

/// A block may nest inside other blocks but never cover an active booking.
pub(crate) fn check_block_clear(schedule: &BarberSchedule, span: &Span) -> Result<(), EngineError> {
    match detect(
        schedule.overlapping_bookings(span),
        std::iter::empty::<&UnavailabilityBlock>(),
        span,
        None,
    ) {
        Some(occupant) => Err(EngineError::BlockedByBookings {
            booking_id: occupant.id(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const M: Ms = MINUTE_MS;
    const H: Ms = 60 * M;
    /// 2026-10-16T00:00:00Z
    const DAY: Ms = 1_792_108_800_000;

    const NO_BLOCKS: [&UnavailabilityBlock; 0] = [];

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            barber_id: Ulid::nil(),
            service_id: None,
            client_name: "c".into(),
            client_id: None,
            span: Span::new(start, end),
            duration_minutes: ((end - start) / M) as u32,
            price_at_booking: Decimal::ZERO,
            status,
            notes: None,
            created_at: 0,
        }
    }

    fn block(start: Ms, end: Ms) -> UnavailabilityBlock {
        UnavailabilityBlock {
            id: Ulid::new(),
            barber_id: Ulid::nil(),
            span: Span::new(start, end),
            reason: None,
        }
    }

    #[test]
    fn checked_span_truncates_then_validates() {
        let s = checked_span(DAY + 10 * H + 59_999, DAY + 11 * H + 30_000, MAX_BOOKING_SPAN_MS).unwrap();
        assert_eq!(s, Span::new(DAY + 10 * H, DAY + 11 * H));
        // Same minute on both ends collapses to empty.
        assert!(matches!(
            checked_span(DAY + 10 * H + 5_000, DAY + 10 * H + 50_000, MAX_BOOKING_SPAN_MS),
            Err(EngineError::Validation(Invalid::EmptyRange { .. }))
        ));
        assert!(matches!(
            checked_span(DAY + 11 * H, DAY + 10 * H, MAX_BOOKING_SPAN_MS),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            checked_span(0, H, MAX_BOOKING_SPAN_MS),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            checked_span(DAY, DAY + 2 * MAX_BOOKING_SPAN_MS, MAX_BOOKING_SPAN_MS),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn detect_finds_active_booking() {
        let b = booking(10 * H, 11 * H, BookingStatus::Scheduled);
        let hit = detect([&b], NO_BLOCKS, &Span::new(10 * H + 30 * M, 11 * H + 30 * M), None);
        assert_eq!(hit, Some(Occupant::Booking(b.id)));
    }

    #[test]
    fn detect_ignores_history() {
        let done = booking(10 * H, 11 * H, BookingStatus::Completed);
        let gone = booking(10 * H, 11 * H, BookingStatus::Cancelled);
        assert_eq!(detect([&done, &gone], NO_BLOCKS, &Span::new(10 * H, 11 * H), None), None);
    }

    #[test]
    fn detect_excludes_self() {
        let b = booking(10 * H, 11 * H, BookingStatus::Scheduled);
        assert_eq!(detect([&b], NO_BLOCKS, &b.span, Some(b.id)), None);
    }

    #[test]
    fn detect_reports_blocks_after_bookings() {
        let u = block(9 * H, 12 * H);
        let b = booking(10 * H, 11 * H, BookingStatus::InProgress);
        let span = Span::new(10 * H, 11 * H);
        assert_eq!(detect([&b], [&u], &span, None), Some(Occupant::Booking(b.id)));
        assert_eq!(detect([&b], [&u], &span, Some(b.id)), Some(Occupant::Unavailability(u.id)));
    }

    #[test]
    fn back_to_back_is_clear() {
        let b = booking(10 * H, 11 * H, BookingStatus::Scheduled);
        let u = block(12 * H, 13 * H);
        assert_eq!(detect([&b], [&u], &Span::new(11 * H, 12 * H), None), None);
    }

    #[test]
    fn blocks_may_nest_but_not_cover_bookings() {
        let mut sched = BarberSchedule::new(Barber {
            id: Ulid::new(),
            name: "b".into(),
            is_active: true,
            created_at: 0,
        });
        sched.insert_block(block(9 * H, 18 * H));
        assert!(check_block_clear(&sched, &Span::new(10 * H, 11 * H)).is_ok());

        let b = booking(14 * H, 15 * H, BookingStatus::Scheduled);
        let id = b.id;
        sched.insert_booking(b);
        assert_eq!(
            check_block_clear(&sched, &Span::new(14 * H + 30 * M, 16 * H)),
            Err(EngineError::BlockedByBookings { booking_id: id })
        );
    }
}
