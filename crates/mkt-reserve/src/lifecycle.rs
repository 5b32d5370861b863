//! Listing lifecycle state machine.
//!
//! # Design
//!
//! Explicit state machine for the reservation-relevant part of a listing's
//! life. Every transition is applied via [`apply`], which admits legal
//! transitions only; anything else returns [`TransitionError`] and the
//! caller maps it to an invalid-state failure.
//!
//! # State diagram
//!
//! ```text
//!   approved --Reserve--> reserved --Complete--> sold (terminal)
//!   reserved --Cancel--> approved
//! ```
//!
//! `pending` and `rejected` are entry/exit states owned by the admin
//! approval flow; they are read-only inputs here and no event applies to
//! them. A listing held in `reserved` stays there until completed or
//! cancelled; there is no expiry.

use mkt_schemas::ListingStatus;

// ---------------------------------------------------------------------------
// ListingEvent
// ---------------------------------------------------------------------------

/// Events that drive listing status transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingEvent {
    /// A buyer claims the listing (-> `reserved`).
    Reserve,
    /// The seller or an admin finalizes the sale (-> `sold`).
    Complete,
    /// A participant or admin releases the reservation (-> `approved`).
    Cancel,
}

impl std::fmt::Display for ListingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListingEvent::Reserve => write!(f, "Reserve"),
            ListingEvent::Complete => write!(f, "Complete"),
            ListingEvent::Cancel => write!(f, "Cancel"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// Returned when an event cannot legally be applied in the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// The status the listing was in when the illegal event arrived.
    pub from: ListingStatus,
    /// The event that was rejected.
    pub event: ListingEvent,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal listing transition: {} + {}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Compute the status a listing moves to when `event` is applied in `from`.
///
/// Pure; the caller is responsible for persisting the transition through a
/// conditional write so that racing writers are serialized by the store.
///
/// # Errors
/// [`TransitionError`] for every (status, event) pair outside the diagram.
pub fn apply(from: ListingStatus, event: ListingEvent) -> Result<ListingStatus, TransitionError> {
    use ListingEvent::*;
    use ListingStatus::*;

    match (from, event) {
        (Approved, Reserve) => Ok(Reserved),
        (Reserved, Complete) => Ok(Sold),
        (Reserved, Cancel) => Ok(Approved),
        (from, event) => Err(TransitionError { from, event }),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
