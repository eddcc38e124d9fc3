use super::*;
use crate::limits::*;
use rust_decimal::Decimal;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2026-10-16T00:00:00Z
const DAY: Ms = 1_792_108_800_000;

fn at(hour: Ms, minute: Ms) -> Ms {
    DAY + hour * H + minute * M
}

/// The service every test booking refers to.
const SERVICE: Ulid = Ulid(0x0190_0000_0000_0000_0000_0000_0000_0001);

fn haircut() -> Service {
    Service {
        id: SERVICE,
        name: "Corte".into(),
        duration_minutes: 30,
        price: Decimal::new(25000, 2),
        is_active: true,
    }
}

/// Fresh WAL whose only record is the [`haircut`] service.
fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("barbercal_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    Wal::open(&path)
        .unwrap()
        .append(&Event::ServiceSaved { service: haircut() })
        .unwrap();
    path
}

fn engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn new_booking(barber_id: Ulid, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        barber_id,
        service_id: SERVICE,
        client_name: "Juan".into(),
        client_id: None,
        start,
        end,
        price: Decimal::new(25000, 2),
        notes: None,
    }
}

fn moved(booking_id: Ulid, barber_id: Ulid, start: Ms, end: Ms) -> BookingUpdate {
    BookingUpdate {
        booking_id,
        barber_id,
        start,
        end,
        client_name: None,
        service_id: None,
    }
}

/// No barber may hold two active bookings that share time.
async fn assert_no_active_overlap(engine: &Engine) {
    for barber in engine.list_barbers(false).await {
        let sched = engine.schedule(&barber.id).unwrap();
        let guard = sched.read().await;
        let active: Vec<&Booking> = guard.bookings.iter().filter(|b| b.status.is_active()).collect();
        for (i, a) in active.iter().enumerate() {
            for b in &active[i + 1..] {
                assert!(!a.span.overlaps(&b.span), "{} overlaps {}", a.id, b.id);
            }
        }
    }
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn create_booking_normalizes_and_derives_duration() {
    let engine = engine("create_booking.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();

    let b = engine
        .create_booking(new_booking(barber.id, at(10, 0) + 42_123, at(10, 45) + 59_999))
        .await
        .unwrap();
    assert_eq!(b.span, Span::new(at(10, 0), at(10, 45)));
    assert_eq!(b.duration_minutes, 45);
    assert_eq!(b.status, BookingStatus::Scheduled);
    assert_eq!(b.price_at_booking, Decimal::new(25000, 2));
    assert_eq!(engine.get_booking(b.id).await.unwrap(), b);
}

#[tokio::test]
async fn overlapping_create_conflicts() {
    let engine = engine("overlap_conflict.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let first = engine
        .create_booking(new_booking(barber.id, at(10, 0), at(11, 0)))
        .await
        .unwrap();

    let err = engine
        .create_booking(new_booking(barber.id, at(10, 30), at(11, 30)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(Occupant::Booking(first.id)));
    assert_eq!(err.sqlstate(), "23P01");
}

#[tokio::test]
async fn back_to_back_bookings_succeed() {
    let engine = engine("back_to_back.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.create_booking(new_booking(barber.id, at(11, 0), at(12, 0))).await.unwrap();
    engine.create_booking(new_booking(barber.id, at(9, 0), at(10, 0))).await.unwrap();
}

#[tokio::test]
async fn other_barber_is_independent() {
    let engine = engine("other_barber.wal");
    let x = engine.create_barber("X", true).await.unwrap();
    let y = engine.create_barber("Y", true).await.unwrap();
    engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();

    assert!(matches!(
        engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await,
        Err(EngineError::Conflict(_))
    ));
    engine.create_booking(new_booking(y.id, at(10, 0), at(11, 0))).await.unwrap();
}

#[tokio::test]
async fn empty_range_is_validation_not_conflict() {
    let engine = engine("empty_range.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    for (start, end) in [(at(10, 0), at(10, 0)), (at(11, 0), at(10, 0)), (at(10, 0) + 1_000, at(10, 0) + 30_000)] {
        let err = engine.create_booking(new_booking(barber.id, start, end)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{start}..{end}");
    }
}

#[tokio::test]
async fn blank_client_name_rejected() {
    let engine = engine("blank_client.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let mut nb = new_booking(barber.id, at(10, 0), at(11, 0));
    nb.client_name = "   ".into();
    assert_eq!(
        engine.create_booking(nb).await.unwrap_err(),
        EngineError::Validation(Invalid::EmptyClientName)
    );
}

#[tokio::test]
async fn booking_for_unknown_barber_or_service_not_found() {
    let engine = engine("unknown_refs.wal");
    let ghost = Ulid::new();
    assert_eq!(
        engine.create_booking(new_booking(ghost, at(10, 0), at(11, 0))).await.unwrap_err(),
        EngineError::NotFound(ghost)
    );

    let barber = engine.create_barber("Ana", true).await.unwrap();
    let mut nb = new_booking(barber.id, at(10, 0), at(11, 0));
    nb.service_id = ghost;
    assert_eq!(engine.create_booking(nb).await.unwrap_err(), EngineError::NotFound(ghost));
}

#[tokio::test]
async fn completed_and_cancelled_do_not_block() {
    let engine = engine("history_free.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();

    let a = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.start_booking(a.id).await.unwrap();
    engine.complete_booking(a.id).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.cancel_booking(b.id).await.unwrap();

    engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    assert_no_active_overlap(&engine).await;
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_happy_path() {
    let engine = engine("lifecycle.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();

    assert_eq!(engine.start_booking(b.id).await.unwrap().status, BookingStatus::InProgress);
    assert_eq!(engine.complete_booking(b.id).await.unwrap().status, BookingStatus::Completed);
    assert_eq!(engine.get_booking(b.id).await.unwrap().status, BookingStatus::Completed);
}

#[tokio::test]
async fn start_on_terminal_is_illegal() {
    let engine = engine("start_terminal.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let done = engine.create_booking(new_booking(barber.id, at(9, 0), at(10, 0))).await.unwrap();
    engine.start_booking(done.id).await.unwrap();
    engine.complete_booking(done.id).await.unwrap();
    let gone = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.cancel_booking(gone.id).await.unwrap();

    for (id, status) in [(done.id, BookingStatus::Completed), (gone.id, BookingStatus::Cancelled)] {
        let err = engine.start_booking(id).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::IllegalTransition {
                id,
                from: Some(status),
                action: Action::Start,
            }
        );
        assert_eq!(err.sqlstate(), "P0004");
        // Status is untouched.
        assert_eq!(engine.get_booking(id).await.unwrap().status, status);
    }
}

#[tokio::test]
async fn in_progress_cannot_be_cancelled_or_moved() {
    let engine = engine("in_progress_frozen.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.start_booking(b.id).await.unwrap();

    assert_eq!(engine.cancel_booking(b.id).await.unwrap_err().kind(), ErrorKind::IllegalTransition);
    assert_eq!(
        engine
            .update_booking(moved(b.id, barber.id, at(12, 0), at(13, 0)))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::IllegalTransition
    );
}

#[tokio::test]
async fn delete_allowed_from_every_status() {
    let engine = engine("delete_any.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.start_booking(b.id).await.unwrap();
    engine.complete_booking(b.id).await.unwrap();

    let deleted = engine.delete_booking(b.id).await.unwrap();
    assert_eq!(deleted.status, BookingStatus::Completed);
    assert_eq!(engine.get_booking(b.id).await.unwrap_err(), EngineError::NotFound(b.id));
    assert_eq!(engine.delete_booking(b.id).await.unwrap_err(), EngineError::NotFound(b.id));
}

#[tokio::test]
async fn transition_on_missing_booking_not_found() {
    let engine = engine("missing_booking.wal");
    let id = Ulid::new();
    assert_eq!(engine.start_booking(id).await.unwrap_err(), EngineError::NotFound(id));
    assert_eq!(engine.get_booking(id).await.unwrap_err().sqlstate(), "P0003");
}

// ── Reschedule ───────────────────────────────────────────

#[tokio::test]
async fn no_op_move_succeeds() {
    let engine = engine("noop_move.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();

    let after = engine
        .update_booking(moved(b.id, barber.id, at(10, 0), at(11, 0)))
        .await
        .unwrap();
    assert_eq!(after.span, b.span);
    assert_eq!(after.client_name, b.client_name);
}

#[tokio::test]
async fn move_onto_neighbour_conflicts() {
    let engine = engine("move_conflict.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let a = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(11, 0), at(12, 0))).await.unwrap();

    let err = engine
        .update_booking(moved(b.id, barber.id, at(10, 30), at(11, 30)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(Occupant::Booking(a.id)));
    assert_eq!(engine.get_booking(b.id).await.unwrap().span, b.span);
}

#[tokio::test]
async fn shift_overlapping_own_old_slot_succeeds() {
    let engine = engine("self_overlap.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    let after = engine
        .update_booking(moved(b.id, barber.id, at(10, 30), at(11, 30)))
        .await
        .unwrap();
    assert_eq!(after.span, Span::new(at(10, 30), at(11, 30)));
}

#[tokio::test]
async fn move_across_barbers_updates_both() {
    let engine = engine("cross_barber.wal");
    let x = engine.create_barber("X", true).await.unwrap();
    let y = engine.create_barber("Y", true).await.unwrap();
    let b = engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();

    let mut update = moved(b.id, y.id, at(14, 0), at(14, 30));
    update.client_name = Some("Juan Pérez".into());
    let after = engine.update_booking(update).await.unwrap();
    assert_eq!(after.barber_id, y.id);
    assert_eq!(after.duration_minutes, 30);
    assert_eq!(after.client_name, "Juan Pérez");
    assert_eq!(after.price_at_booking, b.price_at_booking);

    let day = Span::new(DAY, DAY + 24 * H);
    assert!(engine.bookings_in_range(day, Some(x.id)).await.unwrap().is_empty());
    assert_eq!(engine.bookings_in_range(day, Some(y.id)).await.unwrap(), vec![after.clone()]);
    assert_eq!(engine.owner_of(&b.id), Some(y.id));

    // Status transitions now resolve through the new barber.
    engine.start_booking(b.id).await.unwrap();
}

#[tokio::test]
async fn move_onto_busy_barber_conflicts_and_leaves_booking() {
    let engine = engine("cross_conflict.wal");
    let x = engine.create_barber("X", true).await.unwrap();
    let y = engine.create_barber("Y", true).await.unwrap();
    let b = engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();
    let busy = engine.create_booking(new_booking(y.id, at(10, 0), at(11, 0))).await.unwrap();

    let err = engine
        .update_booking(moved(b.id, y.id, at(10, 0), at(11, 0)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(Occupant::Booking(busy.id)));
    assert_eq!(engine.get_booking(b.id).await.unwrap().barber_id, x.id);
}

#[tokio::test]
async fn move_to_unknown_barber_not_found() {
    let engine = engine("move_ghost.wal");
    let x = engine.create_barber("X", true).await.unwrap();
    let b = engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();
    let ghost = Ulid::new();
    assert_eq!(
        engine.update_booking(moved(b.id, ghost, at(10, 0), at(11, 0))).await.unwrap_err(),
        EngineError::NotFound(ghost)
    );
}

// ── Unavailability ───────────────────────────────────────

#[tokio::test]
async fn unavailability_blocks_bookings() {
    let engine = engine("block_blocks.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let block = engine
        .create_unavailability(barber.id, at(13, 0), at(14, 0), Some("Comida".into()))
        .await
        .unwrap();

    let err = engine
        .create_booking(new_booking(barber.id, at(13, 30), at(14, 30)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(Occupant::Unavailability(block.id)));
    assert_eq!(err.sqlstate(), "23P01");

    engine.delete_unavailability(block.id).await.unwrap();
    engine.create_booking(new_booking(barber.id, at(13, 30), at(14, 30))).await.unwrap();
}

#[tokio::test]
async fn unavailability_over_active_booking_refused() {
    let engine = engine("block_refused.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();

    let err = engine
        .create_unavailability(barber.id, at(9, 0), at(18, 0), None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::BlockedByBookings { booking_id: b.id });
    assert_eq!(err.sqlstate(), "P0002");

    // Once the booking is history the block is fine.
    engine.cancel_booking(b.id).await.unwrap();
    engine.create_unavailability(barber.id, at(9, 0), at(18, 0), None).await.unwrap();
}

#[tokio::test]
async fn blocks_may_overlap_each_other() {
    let engine = engine("block_nest.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    engine.create_unavailability(barber.id, at(9, 0), at(18, 0), None).await.unwrap();
    engine.create_unavailability(barber.id, at(12, 0), at(13, 0), None).await.unwrap();
    let day = Span::new(DAY, DAY + 24 * H);
    assert_eq!(engine.unavailability_in_range(day, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn multi_day_block_visible_on_each_day() {
    let engine = engine("block_multi_day.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    engine
        .create_unavailability(barber.id, DAY, DAY + 3 * 24 * H, Some("Vacaciones".into()))
        .await
        .unwrap();
    let second_day = Span::new(DAY + 24 * H, DAY + 48 * H);
    assert_eq!(engine.unavailability_in_range(second_day, Some(barber.id)).await.unwrap().len(), 1);
}

// ── Roster and catalog ───────────────────────────────────

#[tokio::test]
async fn barber_with_bookings_cannot_be_deleted() {
    let engine = engine("barber_delete.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.cancel_booking(b.id).await.unwrap();

    let err = engine.delete_barber(barber.id).await.unwrap_err();
    assert_eq!(err, EngineError::HasBookings(barber.id));
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let inactive = engine.set_barber_active(barber.id, false).await.unwrap();
    assert!(!inactive.is_active);
    assert!(engine.list_barbers(true).await.is_empty());
    assert_eq!(engine.list_barbers(false).await.len(), 1);

    engine.delete_booking(b.id).await.unwrap();
    engine.delete_barber(barber.id).await.unwrap();
    assert_eq!(engine.get_barber(barber.id).await.unwrap_err(), EngineError::NotFound(barber.id));
}

#[tokio::test]
async fn inactive_barber_takes_no_new_bookings() {
    let engine = engine("inactive_barber.wal");
    let barber = engine.create_barber("Ana", false).await.unwrap();
    let err = engine
        .create_booking(new_booking(barber.id, at(10, 0), at(11, 0)))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation(Invalid::InactiveBarber(barber.id)));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(engine.bookings_in_range(Span::new(DAY, DAY + 24 * H), None).await.unwrap().is_empty());

    engine.set_barber_active(barber.id, true).await.unwrap();
    engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
}

#[tokio::test]
async fn deactivated_barber_keeps_and_adjusts_existing_bookings() {
    let engine = engine("inactive_moves.wal");
    let x = engine.create_barber("X", true).await.unwrap();
    let y = engine.create_barber("Y", true).await.unwrap();
    let b = engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.set_barber_active(y.id, false).await.unwrap();

    let err = engine.update_booking(moved(b.id, y.id, at(10, 0), at(11, 0))).await.unwrap_err();
    assert_eq!(err, EngineError::Validation(Invalid::InactiveBarber(y.id)));
    assert_eq!(engine.get_booking(b.id).await.unwrap().barber_id, x.id);

    engine.set_barber_active(x.id, false).await.unwrap();
    let shifted = engine.update_booking(moved(b.id, x.id, at(12, 0), at(13, 0))).await.unwrap();
    assert_eq!(shifted.span, Span::new(at(12, 0), at(13, 0)));
    engine.start_booking(b.id).await.unwrap();
}

#[tokio::test]
async fn service_with_bookings_cannot_be_deleted() {
    let engine = engine("service_delete.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    engine.cancel_booking(b.id).await.unwrap();

    let err = engine.delete_service(SERVICE).await.unwrap_err();
    assert_eq!(err, EngineError::ServiceInUse(SERVICE));
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(engine.list_services(false).await.iter().any(|s| s.id == SERVICE));

    engine.delete_booking(b.id).await.unwrap();
    engine.delete_service(SERVICE).await.unwrap();
    assert!(engine.list_services(false).await.is_empty());
    assert_eq!(engine.delete_service(SERVICE).await.unwrap_err(), EngineError::NotFound(SERVICE));
    assert_eq!(
        engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap_err(),
        EngineError::NotFound(SERVICE)
    );
}

#[tokio::test]
async fn deleted_service_stays_deleted_after_replay() {
    let path = test_wal_path("service_delete_replay.wal");
    let notify = Arc::new(NotifyHub::new());
    let beard = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let beard = engine.create_service("Barba", 20, Decimal::new(90, 0)).await.unwrap();
        engine.delete_service(SERVICE).await.unwrap();
        beard
    };
    let engine = Engine::new(path.clone(), notify.clone()).unwrap();
    assert_eq!(engine.list_services(false).await, vec![beard.clone()]);

    engine.compact_wal().await.unwrap();
    drop(engine);
    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.list_services(false).await, vec![beard]);
}

#[tokio::test]
async fn service_price_change_is_not_retroactive() {
    let engine = engine("service_price.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let cut = engine.create_service("Corte", 30, Decimal::new(150, 0)).await.unwrap();
    let mut nb = new_booking(barber.id, at(10, 0), at(10, 30));
    nb.service_id = cut.id;
    nb.price = cut.price;
    let b = engine.create_booking(nb).await.unwrap();

    engine
        .update_service(cut.id, "Corte", 45, Decimal::new(200, 0), true)
        .await
        .unwrap();
    let after = engine.get_booking(b.id).await.unwrap();
    assert_eq!(after.price_at_booking, Decimal::new(150, 0));
    assert_eq!(after.duration_minutes, 30);

    engine.update_service(cut.id, "Corte", 45, Decimal::new(200, 0), false).await.unwrap();
    assert!(!engine.list_services(true).await.iter().any(|s| s.id == cut.id));
    assert!(engine.list_services(false).await.iter().any(|s| s.id == cut.id));
}

#[tokio::test]
async fn service_validation() {
    let engine = engine("service_validation.wal");
    assert_eq!(
        engine.create_service("Corte", 0, Decimal::ONE).await.unwrap_err(),
        EngineError::Validation(Invalid::ZeroDuration)
    );
    assert_eq!(
        engine.create_service("Corte", 30, Decimal::new(-1, 0)).await.unwrap_err(),
        EngineError::Validation(Invalid::NegativePrice)
    );
    let ghost = Ulid::new();
    assert_eq!(
        engine.update_service(ghost, "x", 30, Decimal::ONE, true).await.unwrap_err(),
        EngineError::NotFound(ghost)
    );
}

#[tokio::test]
async fn settings_defaults_and_update() {
    let engine = engine("settings.wal");
    assert_eq!(engine.settings().await, BusinessSettings::default());

    let nine = chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap();
    let seven = chrono::NaiveTime::from_hms_opt(19, 0, 0).unwrap();
    let s = engine.update_settings(nine, seven, 45).await.unwrap();
    assert_eq!(s.slot_interval, SlotInterval::FortyFive);
    assert_eq!(engine.settings().await, s);

    assert_eq!(
        engine.update_settings(seven, nine, 30).await.unwrap_err(),
        EngineError::Validation(Invalid::BusinessHours)
    );
    assert_eq!(
        engine.update_settings(nine, seven, 25).await.unwrap_err(),
        EngineError::Validation(Invalid::SlotInterval(25))
    );
}

#[tokio::test]
async fn check_conflict_reports_without_mutating() {
    let engine = engine("check_conflict.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();

    assert_eq!(
        engine.check_conflict(barber.id, at(10, 30), at(11, 30), None).await.unwrap(),
        Some(Occupant::Booking(b.id))
    );
    assert_eq!(engine.check_conflict(barber.id, at(10, 30), at(11, 30), Some(b.id)).await.unwrap(), None);
    assert_eq!(engine.check_conflict(barber.id, at(11, 0), at(12, 0), None).await.unwrap(), None);
}

#[tokio::test]
async fn query_window_limit() {
    let engine = engine("window_limit.wal");
    let wide = Span::new(DAY, DAY + MAX_QUERY_WINDOW_MS + H);
    assert!(matches!(
        engine.bookings_in_range(wide, None).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_everything() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());

    let (x, y, booking, block, service) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let x = engine.create_barber("X", true).await.unwrap();
        let y = engine.create_barber("Y", true).await.unwrap();
        let service = engine.create_service("Barba", 20, Decimal::new(90, 0)).await.unwrap();
        let b = engine.create_booking(new_booking(x.id, at(10, 0), at(11, 0))).await.unwrap();
        engine.update_booking(moved(b.id, y.id, at(12, 0), at(12, 40))).await.unwrap();
        engine.start_booking(b.id).await.unwrap();
        engine.set_barber_active(y.id, false).await.unwrap();
        let block = engine.create_unavailability(x.id, at(15, 0), at(16, 0), None).await.unwrap();
        let gone = engine.create_booking(new_booking(x.id, at(8, 0), at(9, 0))).await.unwrap();
        engine.delete_booking(gone.id).await.unwrap();
        (x, y, engine.get_booking(b.id).await.unwrap(), block, service)
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.get_barber(x.id).await.unwrap(), x);
    assert!(!engine.get_barber(y.id).await.unwrap().is_active);
    let restored = engine.get_booking(booking.id).await.unwrap();
    assert_eq!(restored, booking);
    assert_eq!(restored.barber_id, y.id);
    assert_eq!(restored.status, BookingStatus::InProgress);
    assert_eq!(engine.list_services(false).await, vec![service, haircut()]);
    let day = Span::new(DAY, DAY + 24 * H);
    assert_eq!(engine.unavailability_in_range(day, None).await.unwrap(), vec![block]);
    assert_eq!(engine.bookings_in_range(day, Some(x.id)).await.unwrap(), vec![]);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let notify = Arc::new(NotifyHub::new());

    let (barber, kept) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let barber = engine.create_barber("Ana", true).await.unwrap();
        for i in 0..10 {
            let b = engine
                .create_booking(new_booking(barber.id, at(8 + i, 0), at(8 + i, 30)))
                .await
                .unwrap();
            engine.delete_booking(b.id).await.unwrap();
        }
        let kept = engine.create_booking(new_booking(barber.id, at(9, 0), at(10, 0))).await.unwrap();
        // 10 creates, 10 deletes, the kept booking, the barber and the seeded service.
        assert_eq!(engine.wal_appends_since_compact().await, 23);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        engine.cancel_booking(kept.id).await.unwrap();
        (barber, kept)
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.get_barber(barber.id).await.unwrap(), barber);
    let restored = engine.get_booking(kept.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Cancelled);
    assert_eq!(restored.span, kept.span);
    assert_eq!(engine.settings().await, BusinessSettings::default());
}

#[tokio::test]
async fn mutations_notify_barber_subscribers() {
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(test_wal_path("notify.wal"), notify.clone()).unwrap();
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let mut rx = notify.subscribe(barber.id);

    let b = engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::BookingCreated { booking } if booking.id == b.id));
    engine.cancel_booking(b.id).await.unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::BookingStatusChanged { status: BookingStatus::Cancelled, .. }
    ));
}

#[tokio::test]
async fn commit_time_overlap_reads_as_the_same_conflict() {
    let engine = engine("exclusion_commit.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let mut guard = engine.lock_barber(barber.id).await.unwrap();
    // Stands in for a booking that committed between another caller's
    // pre-check and its append.
    let planted = Booking {
        id: Ulid::new(),
        barber_id: barber.id,
        service_id: Some(SERVICE),
        client_name: "Primero".into(),
        client_id: None,
        span: Span::new(at(10, 0), at(11, 0)),
        duration_minutes: 60,
        price_at_booking: Decimal::ZERO,
        status: BookingStatus::Scheduled,
        notes: None,
        created_at: 0,
    };
    guard.insert_booking(planted.clone());
    let late = Booking {
        id: Ulid::new(),
        client_name: "Segundo".into(),
        span: Span::new(at(10, 30), at(11, 30)),
        duration_minutes: 60,
        ..planted.clone()
    };
    let at_commit = engine
        .persist_and_apply(&mut guard, &Event::BookingCreated { booking: late.clone() })
        .await
        .unwrap_err();
    assert_eq!(at_commit, EngineError::Conflict(Occupant::Booking(planted.id)));
    assert!(guard.booking(late.id).is_none());
    drop(guard);
    assert_eq!(engine.wal_appends_since_compact().await, appends);

    let early = engine
        .create_booking(new_booking(barber.id, at(10, 30), at(11, 30)))
        .await
        .unwrap_err();
    assert_eq!(early, at_commit);
    assert_eq!(early.kind(), at_commit.kind());
    assert_eq!(early.sqlstate(), "23P01");
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_one_winner() {
    let engine = Arc::new(engine("race_create.wal"));
    let barber = engine.create_barber("Ana", true).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_booking(new_booking(barber.id, at(10, 0), at(11, 0))).await
        }));
    }
    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cross_moves_do_not_deadlock() {
    let engine = Arc::new(engine("race_cross.wal"));
    let x = engine.create_barber("X", true).await.unwrap();
    let y = engine.create_barber("Y", true).await.unwrap();
    let bx = engine.create_booking(new_booking(x.id, at(9, 0), at(10, 0))).await.unwrap();
    let by = engine.create_booking(new_booking(y.id, at(9, 0), at(10, 0))).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        let (id, to) = if i % 2 == 0 { (bx.id, y.id) } else { (by.id, x.id) };
        handles.push(tokio::spawn(async move {
            engine.update_booking(moved(id, to, at(11 + i, 0), at(11 + i, 30))).await
        }));
    }
    for h in handles {
        // Conflicts are fine; hangs and panics are not.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), h)
            .await
            .expect("cross-barber moves deadlocked")
            .unwrap();
    }
    assert_no_active_overlap(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn random_mutations_keep_no_overlap_invariant() {
    let engine = Arc::new(engine("random_mutations.wal"));
    let mut barbers = Vec::new();
    for name in ["A", "B", "C"] {
        barbers.push(engine.create_barber(name, true).await.unwrap().id);
    }

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let engine = engine.clone();
        let barbers = barbers.clone();
        handles.push(tokio::spawn(async move {
            // Small LCG so every run exercises the same interleaving candidates.
            let mut seed = worker.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let mut next = move |n: u64| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (seed >> 33) % n
            };
            let mut mine: Vec<Ulid> = Vec::new();
            for _ in 0..60 {
                let barber = barbers[next(3) as usize];
                let start = at(8, 0) + next(48) as Ms * 15 * M;
                let end = start + (1 + next(4)) as Ms * 15 * M;
                match next(6) {
                    0 | 1 => {
                        if let Ok(b) = engine.create_booking(new_booking(barber, start, end)).await {
                            mine.push(b.id);
                        }
                    }
                    2 if !mine.is_empty() => {
                        let id = mine[next(mine.len() as u64) as usize];
                        let _ = engine.update_booking(moved(id, barber, start, end)).await;
                    }
                    3 if !mine.is_empty() => {
                        let id = mine[next(mine.len() as u64) as usize];
                        let _ = engine.cancel_booking(id).await;
                    }
                    4 if !mine.is_empty() => {
                        let id = mine[next(mine.len() as u64) as usize];
                        let _ = engine.start_booking(id).await;
                    }
                    _ => {
                        let _ = engine.create_unavailability(barber, start, end, None).await;
                    }
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_no_active_overlap(&engine).await;

    // Active bookings and blocks never share time, whichever came first.
    for barber in &barbers {
        let sched = engine.schedule(barber).unwrap();
        let guard = sched.read().await;
        for b in guard.bookings.iter().filter(|b| b.status.is_active()) {
            assert!(guard.overlapping_blocks(&b.span).next().is_none(), "{} under a block", b.id);
        }
    }
}

#[test]
fn limits_are_consistent() {
    assert!(MAX_BOOKING_SPAN_MS <= MAX_BLOCK_SPAN_MS);
    assert!(MAX_BLOCK_SPAN_MS <= MAX_QUERY_WINDOW_MS);
    assert!(MAX_NOTES_LEN + MAX_CLIENT_NAME_LEN + MAX_NAME_LEN < MAX_WAL_RECORD_BYTES);
}
