use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::NaiveTime;
use rust_decimal::Decimal;

use crate::notify::NotifyHub;
use crate::wal::Wal;

const M: Ms = 60_000;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
}

fn zone() -> BusinessZone {
    BusinessZone::default()
}

/// Shop wall-clock time on the test day.
fn local(hour: u32, minute: u32) -> Ms {
    zone()
        .to_utc(day().and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap()))
        .unwrap()
}

/// Seeded into every test engine; all bookings here use it.
const SERVICE: Ulid = Ulid(0x0190_0000_0000_0000_0000_0000_0000_0002);

fn engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("barbercal_test_agenda");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let fade = Service {
        id: SERVICE,
        name: "Fade".into(),
        duration_minutes: 45,
        price: Decimal::new(18000, 2),
        is_active: true,
    };
    Wal::open(&path)
        .unwrap()
        .append(&Event::ServiceSaved { service: fade })
        .unwrap();
    Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap())
}

fn new_booking(barber_id: Ulid, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        barber_id,
        service_id: SERVICE,
        client_name: "Luis".into(),
        client_id: None,
        start,
        end,
        price: Decimal::new(18000, 2),
        notes: None,
    }
}

/// Counts mutating calls and can drop them on the floor.
struct Flaky {
    inner: Arc<Engine>,
    down: AtomicBool,
    mutations: AtomicUsize,
}

impl Flaky {
    fn new(inner: Arc<Engine>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            mutations: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), CallError> {
        if self.down.load(Ordering::SeqCst) {
            Err(CallError::Transport("connection reset".into()))
        } else {
            Ok(())
        }
    }

    fn mutated(&self) -> Result<(), CallError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

#[async_trait]
impl Scheduler for Flaky {
    async fn list_barbers(&self, active_only: bool) -> Result<Vec<Barber>, CallError> {
        self.check()?;
        Scheduler::list_barbers(&self.inner, active_only).await
    }

    async fn list_services(&self, active_only: bool) -> Result<Vec<Service>, CallError> {
        self.check()?;
        Scheduler::list_services(&self.inner, active_only).await
    }

    async fn settings(&self) -> Result<BusinessSettings, CallError> {
        self.check()?;
        Scheduler::settings(&self.inner).await
    }

    async fn bookings_in_range(&self, window: Span) -> Result<Vec<Booking>, CallError> {
        self.check()?;
        Scheduler::bookings_in_range(&self.inner, window).await
    }

    async fn unavailability_in_range(&self, window: Span) -> Result<Vec<UnavailabilityBlock>, CallError> {
        self.check()?;
        Scheduler::unavailability_in_range(&self.inner, window).await
    }

    async fn create_booking(&self, new: NewBooking) -> Result<Booking, CallError> {
        self.mutated()?;
        Scheduler::create_booking(&self.inner, new).await
    }

    async fn update_booking(&self, update: BookingUpdate) -> Result<Booking, CallError> {
        self.mutated()?;
        Scheduler::update_booking(&self.inner, update).await
    }

    async fn transition_booking(&self, id: Ulid, action: Action) -> Result<Booking, CallError> {
        self.mutated()?;
        Scheduler::transition_booking(&self.inner, id, action).await
    }

    async fn delete_booking(&self, id: Ulid) -> Result<(), CallError> {
        self.mutated()?;
        Scheduler::delete_booking(&self.inner, id).await
    }

    async fn create_unavailability(
        &self,
        barber_id: Ulid,
        start: Ms,
        end: Ms,
        reason: Option<String>,
    ) -> Result<UnavailabilityBlock, CallError> {
        self.mutated()?;
        Scheduler::create_unavailability(&self.inner, barber_id, start, end, reason).await
    }
}

async fn agenda<S: Scheduler>(scheduler: S) -> Agenda<S> {
    let agenda = Agenda::new(scheduler, zone(), day()).unwrap();
    agenda.refresh().await.unwrap();
    agenda
}

#[tokio::test]
async fn refresh_loads_the_local_day() {
    let engine = engine("refresh.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    engine.create_barber("Retired", false).await.unwrap();
    engine
        .create_booking(new_booking(barber.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    // Previous local day, same UTC date.
    engine
        .create_booking(new_booking(barber.id, local(0, 0) - 60 * M, local(0, 0) - 30 * M))
        .await
        .unwrap();

    let agenda = agenda(engine.clone()).await;
    let snap = agenda.snapshot();
    assert!(!snap.stale);
    assert_eq!(snap.barbers.len(), 1);
    assert_eq!(snap.bookings.len(), 1);
    assert_eq!(snap.settings, BusinessSettings::default());
}

#[tokio::test]
async fn slots_follow_business_hours_in_local_time() {
    let engine = engine("slots.wal");
    let agenda = agenda(engine.clone()).await;

    let slots = agenda.slots();
    assert_eq!(slots.len(), 24);
    assert_eq!(slots[0], local(8, 0));
    assert_eq!(slots[1] - slots[0], 30 * M);
    assert_eq!(*slots.last().unwrap(), local(19, 30));
}

#[tokio::test]
async fn create_goes_through_and_lands_in_snapshot() {
    let engine = engine("agenda_create.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let agenda = agenda(engine.clone()).await;

    let b = agenda
        .create_booking(new_booking(barber.id, local(10, 0) + 1_500, local(10, 45)))
        .await
        .unwrap();
    assert_eq!(b.span.start, local(10, 0));
    assert_eq!(agenda.snapshot().booking(b.id), Some(&b));
    assert!(agenda.inflight().is_empty());
}

#[tokio::test]
async fn doomed_slot_is_refused_without_a_call() {
    let engine = engine("agenda_doomed.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let existing = engine
        .create_booking(new_booking(barber.id, local(10, 0), local(11, 0)))
        .await
        .unwrap();
    let flaky = Arc::new(Flaky::new(engine.clone()));
    let agenda = agenda(flaky.clone()).await;

    let err = agenda
        .create_booking(new_booking(barber.id, local(10, 30), local(11, 30)))
        .await
        .unwrap_err();
    assert_eq!(err, AgendaError::Doomed(Occupant::Booking(existing.id)));
    assert_eq!(flaky.mutations.load(Ordering::SeqCst), 0);
    assert_eq!(err.user_message(), "That time is already taken. Pick another slot.");
}

#[tokio::test]
async fn stale_snapshot_still_loses_to_the_server() {
    let engine = engine("agenda_stale.wal");
    let barber = engine.create_barber("Ana", true).await.unwrap();
    let front = agenda(engine.clone()).await;
    let back = agenda(engine.clone()).await;

    let won = front
        .create_booking(new_booking(barber.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();

    // `back` has not refreshed, so its shadow check says clear.
    let span = Span::new(local(10, 0), local(10, 30));
    assert_eq!(back.shadow_check(barber.id, &span, None), Advice::Clear);
    let err = back
        .create_booking(new_booking(barber.id, local(10, 0), local(10, 30)))
        .await
        .unwrap_err();
    assert_eq!(err, AgendaError::Rejected(EngineError::Conflict(Occupant::Booking(won.id))));
    assert_eq!(err.user_message(), "That time is already taken. Pick another slot.");
}

#[tokio::test]
async fn move_keeps_duration_and_switches_barber() {
    let engine = engine("agenda_move.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let y = engine.create_barber("Beto", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 45)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;

    let moved = agenda.move_booking(b.id, y.id, local(15, 0) + 9_000).await.unwrap();
    assert_eq!(moved.barber_id, y.id);
    assert_eq!(moved.span, Span::new(local(15, 0), local(15, 45)));
    assert_eq!(agenda.snapshot().booking(b.id), Some(&moved));
}

#[tokio::test]
async fn rejected_move_restores_exact_prior() {
    let engine = engine("agenda_revert.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let mine = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;

    // Someone else takes 12:00 after our last refresh.
    let theirs = engine
        .create_booking(new_booking(x.id, local(12, 0), local(12, 30)))
        .await
        .unwrap();

    let err = agenda.move_booking(mine.id, x.id, local(12, 0)).await.unwrap_err();
    assert_eq!(err, AgendaError::Rejected(EngineError::Conflict(Occupant::Booking(theirs.id))));
    assert_eq!(agenda.snapshot().booking(mine.id), Some(&mine));
    assert_eq!(engine.get_booking(mine.id).await.unwrap(), mine);
}

#[tokio::test]
async fn lost_move_reverts_and_marks_stale() {
    let engine = engine("agenda_transport.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let flaky = Arc::new(Flaky::new(engine.clone()));
    let agenda = agenda(flaky.clone()).await;

    flaky.down.store(true, Ordering::SeqCst);
    let err = agenda.move_booking(b.id, x.id, local(16, 0)).await.unwrap_err();
    assert!(matches!(err, AgendaError::Transport(_)));
    let snap = agenda.snapshot();
    assert!(snap.stale);
    assert_eq!(snap.booking(b.id), Some(&b));
    assert!(agenda.view().await.is_err());

    flaky.down.store(false, Ordering::SeqCst);
    let snap = agenda.view().await.unwrap();
    assert!(!snap.stale);
    assert_eq!(snap.booking(b.id), Some(&b));
}

#[tokio::test]
async fn busy_entity_refuses_second_operation() {
    let engine = engine("agenda_busy.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;

    let held = agenda.inflight().try_begin(b.id, "reschedule").unwrap();
    let err = agenda.transition(b.id, Action::Cancel).await.unwrap_err();
    assert_eq!(err, AgendaError::Busy { id: b.id, op: "reschedule" });

    // A create on the same barber is keyed separately from the booking.
    let other = agenda.inflight().try_begin(x.id, "create").unwrap();
    let err = agenda
        .create_booking(new_booking(x.id, local(14, 0), local(14, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, AgendaError::Busy { .. }));

    drop((held, other));
    let cancelled = agenda.transition(b.id, Action::Cancel).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn status_gating_offers_only_legal_actions() {
    let engine = engine("agenda_gate.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let flaky = Arc::new(Flaky::new(engine.clone()));
    let agenda = agenda(flaky.clone()).await;

    let err = agenda.transition(b.id, Action::Complete).await.unwrap_err();
    assert_eq!(
        err,
        AgendaError::Gated {
            id: b.id,
            status: BookingStatus::Scheduled,
            action: Action::Complete
        }
    );
    assert_eq!(err.user_message(), "A scheduled appointment cannot be completed.");
    assert_eq!(flaky.mutations.load(Ordering::SeqCst), 0);

    agenda.transition(b.id, Action::Start).await.unwrap();
    let done = agenda.transition(b.id, Action::Complete).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);

    let err = agenda.move_booking(b.id, x.id, local(17, 0)).await.unwrap_err();
    assert!(matches!(err, AgendaError::Gated { action: Action::Reschedule, .. }));
    assert_eq!(flaky.mutations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn deleting_history_needs_confirmation() {
    let engine = engine("agenda_delete.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let live = engine
        .create_booking(new_booking(x.id, local(9, 0), local(9, 30)))
        .await
        .unwrap();
    let old = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    engine.cancel_booking(old.id).await.unwrap();
    let agenda = agenda(engine.clone()).await;

    agenda.delete_booking(live.id, false).await.unwrap();
    assert_eq!(
        agenda.delete_booking(old.id, false).await.unwrap_err(),
        AgendaError::NeedsConfirmation(old.id)
    );
    agenda.delete_booking(old.id, true).await.unwrap();
    assert!(agenda.snapshot().bookings.is_empty());
}

#[tokio::test]
async fn vanished_booking_reports_and_refreshes() {
    let engine = engine("agenda_vanished.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;
    engine.delete_booking(b.id).await.unwrap();

    let err = agenda.transition(b.id, Action::Cancel).await.unwrap_err();
    assert_eq!(err, AgendaError::Rejected(EngineError::NotFound(b.id)));
    assert!(agenda.snapshot().stale);
    assert!(agenda.view().await.unwrap().booking(b.id).is_none());
    assert_eq!(
        agenda.transition(b.id, Action::Cancel).await.unwrap_err(),
        AgendaError::UnknownBooking(b.id)
    );
}

#[tokio::test]
async fn block_time_checks_bookings_only() {
    let engine = engine("agenda_block.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    let b = engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;

    let err = agenda
        .block_time(x.id, local(9, 0), local(12, 0), Some("dentist".into()))
        .await
        .unwrap_err();
    assert_eq!(err, AgendaError::Doomed(Occupant::Booking(b.id)));

    agenda.block_time(x.id, local(13, 0), local(15, 0), None).await.unwrap();
    agenda.block_time(x.id, local(14, 0), local(14, 30), None).await.unwrap();
    assert_eq!(agenda.snapshot().blocks.len(), 2);

    let err = agenda
        .create_booking(new_booking(x.id, local(14, 0), local(14, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, AgendaError::Doomed(Occupant::Unavailability(_))));
}

#[tokio::test]
async fn set_day_navigates() {
    let engine = engine("agenda_day.wal");
    let x = engine.create_barber("Ana", true).await.unwrap();
    engine
        .create_booking(new_booking(x.id, local(10, 0), local(10, 30)))
        .await
        .unwrap();
    let agenda = agenda(engine.clone()).await;
    assert_eq!(agenda.snapshot().bookings.len(), 1);

    agenda.set_day(day().succ_opt().unwrap()).await.unwrap();
    let snap = agenda.snapshot();
    assert_eq!(snap.day, day().succ_opt().unwrap());
    assert!(snap.bookings.is_empty());
    assert_eq!(snap.window.start, local(0, 0) + 24 * 60 * M);
}

#[test]
fn wal_failures_surface_as_transport() {
    assert_eq!(
        CallError::from(EngineError::WalError("disk full".into())),
        CallError::Transport("disk full".into())
    );
    assert!(matches!(
        CallError::from(EngineError::NotFound(Ulid::nil())),
        CallError::Rejected(EngineError::NotFound(_))
    ));
}

#[test]
fn rejections_read_as_plain_messages() {
    let blocked = AgendaError::Rejected(EngineError::BlockedByBookings { booking_id: Ulid::nil() });
    assert_eq!(
        blocked.user_message(),
        "There are appointments in that period. Move or cancel them first."
    );
    let unavailable = AgendaError::Rejected(EngineError::Conflict(Occupant::Unavailability(Ulid::nil())));
    assert_eq!(unavailable.user_message(), "The barber is unavailable at that time.");
}

#[test]
fn inactive_barber_and_used_service_have_their_own_copy() {
    let inactive = AgendaError::Rejected(EngineError::Validation(Invalid::InactiveBarber(Ulid::nil())));
    assert_eq!(inactive.user_message(), "This barber is not taking appointments right now.");
    let in_use = AgendaError::Rejected(EngineError::ServiceInUse(Ulid::nil()));
    assert!(in_use.user_message().starts_with("This service has appointments."));
}
