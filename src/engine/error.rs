use ulid::Ulid;

use crate::model::{BookingStatus, Ms, Occupant};

use super::lifecycle::Action;

/// Why an input was refused before any conflict check ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    /// `end <= start` once both ends are truncated to the minute.
    EmptyRange { start: Ms, end: Ms },
    EmptyClientName,
    EmptyName,
    ZeroDuration,
    NegativePrice,
    /// Opening time not before closing time.
    BusinessHours,
    SlotInterval(u32),
    /// Deactivated barbers take no new bookings.
    InactiveBarber(Ulid),
}

impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invalid::EmptyRange { start, end } => {
                write!(f, "end time must be after start time ({start} >= {end})")
            }
            Invalid::EmptyClientName => f.write_str("client name must not be empty"),
            Invalid::EmptyName => f.write_str("name must not be empty"),
            Invalid::ZeroDuration => f.write_str("duration must be at least one minute"),
            Invalid::NegativePrice => f.write_str("price must not be negative"),
            Invalid::BusinessHours => f.write_str("opening time must be before closing time"),
            Invalid::SlotInterval(m) => {
                write!(f, "slot interval must be 15, 20, 30, 45 or 60 minutes (got {m})")
            }
            Invalid::InactiveBarber(id) => write!(f, "barber {id} is not active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The span is taken by an active booking or an unavailability block.
    Conflict(Occupant),
    /// An unavailability block would cover an active booking.
    BlockedByBookings { booking_id: Ulid },
    IllegalTransition {
        id: Ulid,
        from: Option<BookingStatus>,
        action: Action,
    },
    Validation(Invalid),
    /// Barber still referenced by bookings; deactivate instead.
    HasBookings(Ulid),
    /// Service still referenced by bookings; deactivate instead.
    ServiceInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

/// Coarse classification shared by the wire layer and the agenda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Conflict,
    BlockedByBookings,
    NotFound,
    IllegalTransition,
    Validation,
    Forbidden,
    AlreadyExists,
    LimitExceeded,
    Internal,
}

impl ErrorKind {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "23P01",
            ErrorKind::BlockedByBookings => "P0002",
            ErrorKind::NotFound => "P0003",
            ErrorKind::IllegalTransition => "P0004",
            ErrorKind::Validation => "22023",
            ErrorKind::Forbidden => "23503",
            ErrorKind::AlreadyExists => "23505",
            ErrorKind::LimitExceeded => "54000",
            ErrorKind::Internal => "58030",
        }
    }

    pub fn from_sqlstate(code: &str) -> Option<Self> {
        Some(match code {
            "23P01" => ErrorKind::Conflict,
            "P0002" => ErrorKind::BlockedByBookings,
            "P0003" => ErrorKind::NotFound,
            "P0004" => ErrorKind::IllegalTransition,
            "22023" => ErrorKind::Validation,
            "23503" => ErrorKind::Forbidden,
            "23505" => ErrorKind::AlreadyExists,
            "54000" => ErrorKind::LimitExceeded,
            "58030" => ErrorKind::Internal,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::BlockedByBookings => "blocked_by_bookings",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::Validation => "validation",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::BlockedByBookings { .. } => ErrorKind::BlockedByBookings,
            EngineError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::HasBookings(_) | EngineError::ServiceInUse(_) => ErrorKind::Forbidden,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        self.kind().sqlstate()
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(occ) => {
                write!(f, "time slot overlaps {} {}", occ.kind(), occ.id())
            }
            EngineError::BlockedByBookings { booking_id } => {
                write!(f, "unavailability would cover active booking {booking_id}")
            }
            EngineError::IllegalTransition { id, from, action } => match from {
                Some(status) => write!(f, "cannot {action} booking {id} in status {status}"),
                None => write!(f, "cannot {action} booking {id}: it does not exist yet"),
            },
            EngineError::Validation(reason) => write!(f, "invalid input: {reason}"),
            EngineError::HasBookings(id) => {
                write!(f, "barber {id} has bookings; deactivate instead of deleting")
            }
            EngineError::ServiceInUse(id) => {
                write!(f, "service {id} has bookings; deactivate instead of deleting")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
