use chrono::{NaiveTime, TimeDelta};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    /// The one overlap test. Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    pub fn shifted(&self, by: Ms) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

/// Persisted booking status. The client-only "new" state has no
/// representation here: a booking exists once it is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Active bookings occupy schedule space; the rest are history.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Scheduled | BookingStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(BookingStatus::Scheduled),
            "in_progress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// What a candidate interval ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Occupant {
    Booking(Ulid),
    Unavailability(Ulid),
}

impl Occupant {
    pub fn id(&self) -> Ulid {
        match self {
            Occupant::Booking(id) | Occupant::Unavailability(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Occupant::Booking(_) => "booking",
            Occupant::Unavailability(_) => "unavailability",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barber {
    pub id: Ulid,
    pub name: String,
    pub is_active: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    #[serde(with = "decimal_bytes")]
    pub price: Decimal,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub barber_id: Ulid,
    pub service_id: Option<Ulid>,
    pub client_name: String,
    pub client_id: Option<Ulid>,
    pub span: Span,
    /// Stored so the agenda renders the booked length even if the service changes later.
    pub duration_minutes: u32,
    #[serde(with = "decimal_bytes")]
    pub price_at_booking: Decimal,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn occupies(&self, span: &Span) -> bool {
        self.status.is_active() && self.span.overlaps(span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailabilityBlock {
    pub id: Ulid,
    pub barber_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

/// Grid granularity offered by the agenda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotInterval {
    Fifteen,
    Twenty,
    Thirty,
    FortyFive,
    Sixty,
}

impl SlotInterval {
    pub fn minutes(&self) -> u32 {
        match self {
            SlotInterval::Fifteen => 15,
            SlotInterval::Twenty => 20,
            SlotInterval::Thirty => 30,
            SlotInterval::FortyFive => 45,
            SlotInterval::Sixty => 60,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            15 => Some(SlotInterval::Fifteen),
            20 => Some(SlotInterval::Twenty),
            30 => Some(SlotInterval::Thirty),
            45 => Some(SlotInterval::FortyFive),
            60 => Some(SlotInterval::Sixty),
            _ => None,
        }
    }
}

/// Singleton shop settings. Shapes the offered grid only; the engine never
/// refuses a booking for falling outside opening hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessSettings {
    pub opening_time: NaiveTime,
    pub closing_time: NaiveTime,
    pub slot_interval: SlotInterval,
}

impl Default for BusinessSettings {
    fn default() -> Self {
        Self {
            opening_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            closing_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
            slot_interval: SlotInterval::Thirty,
        }
    }
}

impl BusinessSettings {
    /// Local start times of every grid cell between opening and closing.
    pub fn slots(&self) -> Vec<NaiveTime> {
        let step = TimeDelta::minutes(i64::from(self.slot_interval.minutes()));
        let mut slots = Vec::new();
        let mut t = self.opening_time;
        while t < self.closing_time {
            slots.push(t);
            let (next, wrapped) = t.overflowing_add_signed(step);
            if wrapped != 0 {
                break;
            }
            t = next;
        }
        slots
    }
}

/// One barber's schedule: the unit of locking and of conflict detection.
#[derive(Debug, Clone)]
pub struct BarberSchedule {
    pub barber: Barber,
    /// Every booking regardless of status, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `span.start`.
    pub blocks: Vec<UnavailabilityBlock>,
    /// Bumped on every applied change.
    pub version: u64,
}

impl BarberSchedule {
    pub fn new(barber: Barber) -> Self {
        Self {
            barber,
            bookings: Vec::new(),
            blocks: Vec::new(),
            version: 0,
        }
    }

    pub fn id(&self) -> Ulid {
        self.barber.id
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn insert_block(&mut self, block: UnavailabilityBlock) {
        let pos = self
            .blocks
            .partition_point(|b| b.span.start <= block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<UnavailabilityBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Bookings (any status) whose span overlaps the query window.
    /// Everything starting at or after `query.end` is skipped by binary search.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn overlapping_blocks(&self, query: &Span) -> impl Iterator<Item = &UnavailabilityBlock> {
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Storage-level exclusion constraint: would `candidate` share time with
    /// another active booking of this barber? Blocks are not part of it.
    pub fn exclusion_violation(&self, candidate: &Booking) -> Option<Ulid> {
        if !candidate.status.is_active() {
            return None;
        }
        self.overlapping_bookings(&candidate.span)
            .find(|b| b.id != candidate.id && b.status.is_active())
            .map(|b| b.id)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BarberCreated {
        id: Ulid,
        name: String,
        is_active: bool,
        created_at: Ms,
    },
    BarberUpdated {
        id: Ulid,
        name: String,
        is_active: bool,
    },
    BarberDeleted {
        id: Ulid,
    },
    ServiceSaved {
        service: Service,
    },
    ServiceDeleted {
        id: Ulid,
    },
    SettingsUpdated {
        settings: BusinessSettings,
    },
    BookingCreated {
        booking: Booking,
    },
    /// Move and/or edit, possibly across barbers. One record so replay is atomic too.
    BookingRescheduled {
        id: Ulid,
        from_barber: Ulid,
        to_barber: Ulid,
        span: Span,
        duration_minutes: u32,
        client_name: String,
        service_id: Option<Ulid>,
    },
    BookingStatusChanged {
        id: Ulid,
        barber_id: Ulid,
        status: BookingStatus,
    },
    BookingDeleted {
        id: Ulid,
        barber_id: Ulid,
    },
    UnavailabilityCreated {
        block: UnavailabilityBlock,
    },
    UnavailabilityDeleted {
        id: Ulid,
        barber_id: Ulid,
    },
}

/// `Decimal` through its fixed 16-byte form, which bincode round-trips
/// without a self-describing format.
mod decimal_bytes {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        Serialize::serialize(&value.serialize(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let bytes = <[u8; 16]>::deserialize(deserializer)?;
        Ok(Decimal::deserialize(bytes))
    }
}
