use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::detect;
use crate::model::*;

/// What the client-side check thinks of a proposed slot. Advisory only:
/// `Doomed` stops a call that cannot succeed, `Clear` promises nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Clear,
    Doomed(Occupant),
}

/// The last-fetched view of one local day.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub day: NaiveDate,
    pub window: Span,
    pub barbers: Vec<Barber>,
    pub services: Vec<Service>,
    pub bookings: Vec<Booking>,
    pub blocks: Vec<UnavailabilityBlock>,
    pub settings: BusinessSettings,
    /// Set after a transport failure; the next read refetches.
    pub stale: bool,
}

impl Snapshot {
    pub fn empty(day: NaiveDate, window: Span) -> Self {
        Self {
            day,
            window,
            barbers: Vec::new(),
            services: Vec::new(),
            bookings: Vec::new(),
            blocks: Vec::new(),
            settings: BusinessSettings::default(),
            stale: true,
        }
    }

    /// Run the conflict detector over this barber's cached rows.
    pub fn shadow_check(&self, barber_id: Ulid, span: &Span, exclude: Option<Ulid>) -> Advice {
        let bookings = self.bookings.iter().filter(|b| b.barber_id == barber_id);
        let blocks = self.blocks.iter().filter(|u| u.barber_id == barber_id);
        match detect(bookings, blocks, span, exclude) {
            Some(occupant) => Advice::Doomed(occupant),
            None => Advice::Clear,
        }
    }

    /// Blocks may nest, so only active bookings can doom one.
    pub fn shadow_check_block(&self, barber_id: Ulid, span: &Span) -> Advice {
        let bookings = self.bookings.iter().filter(|b| b.barber_id == barber_id);
        match detect(bookings, std::iter::empty::<&UnavailabilityBlock>(), span, None) {
            Some(occupant) => Advice::Doomed(occupant),
            None => Advice::Clear,
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Insert or overwrite by id.
    pub fn put_booking(&mut self, booking: Booking) {
        match self.bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(slot) => *slot = booking,
            None => self.bookings.push(booking),
        }
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn bookings_for(&self, barber_id: Ulid) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(move |b| b.barber_id == barber_id)
    }
}
