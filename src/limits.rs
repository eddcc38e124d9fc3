use crate::model::Ms;

const MINUTE: Ms = 60_000;
const DAY: Ms = 24 * 60 * MINUTE;

pub const MAX_BARBERS: usize = 1_000;
pub const MAX_SERVICES: usize = 1_000;
pub const MAX_BOOKINGS_PER_BARBER: usize = 100_000;
pub const MAX_BLOCKS_PER_BARBER: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CLIENT_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_REASON_LEN: usize = 1_024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking never runs past a day.
pub const MAX_BOOKING_SPAN_MS: Ms = DAY;
/// Unavailability covers vacations too.
pub const MAX_BLOCK_SPAN_MS: Ms = 90 * DAY;

pub const MAX_SERVICE_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_QUERY_WINDOW_MS: Ms = 93 * DAY;

/// Largest WAL payload written or accepted on replay. Every event is far
/// below this; a bigger length prefix means a corrupt tail.
pub const MAX_WAL_RECORD_BYTES: usize = 1 << 20;
