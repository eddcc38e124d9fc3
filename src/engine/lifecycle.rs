//! Booking lifecycle.
//!
//! ```text
//!   (none) ──create──▶ scheduled ──start──▶ in_progress ──complete──▶ completed
//!                        │  ▲
//!                        │  └─reschedule
//!                        └──cancel──▶ cancelled
//! ```
//!
//! Delete is legal from every status and removes the row.

use crate::model::BookingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Start,
    Complete,
    Cancel,
    Reschedule,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Start => "start",
            Action::Complete => "complete",
            Action::Cancel => "cancel",
            Action::Reschedule => "reschedule",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(BookingStatus),
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: Option<BookingStatus>,
    pub action: Action,
}

pub fn transition(
    from: Option<BookingStatus>,
    action: Action,
) -> Result<Transition, IllegalTransition> {
    use BookingStatus::*;
    match (from, action) {
        (_, Action::Delete) => Ok(Transition::Remove),
        (None, Action::Create) => Ok(Transition::To(Scheduled)),
        (Some(Scheduled), Action::Start) => Ok(Transition::To(InProgress)),
        (Some(Scheduled), Action::Reschedule) => Ok(Transition::To(Scheduled)),
        (Some(Scheduled), Action::Cancel) => Ok(Transition::To(Cancelled)),
        (Some(InProgress), Action::Complete) => Ok(Transition::To(Completed)),
        _ => Err(IllegalTransition { from, action }),
    }
}

/// Actions a caller may offer for a booking in `status`.
pub fn allowed_actions(status: BookingStatus) -> &'static [Action] {
    match status {
        BookingStatus::Scheduled => &[Action::Start, Action::Reschedule, Action::Cancel, Action::Delete],
        BookingStatus::InProgress => &[Action::Complete, Action::Delete],
        BookingStatus::Completed | BookingStatus::Cancelled => &[Action::Delete],
    }
}
