//! Canonical wire and storage types for the marketplace reservation core.
//!
//! One schema, shared by the coordinator, the Postgres store, the in-memory
//! test store, and the daemon API surface. No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod prices;

pub use prices::{micros_to_price, price_to_micros, PricingError, MICROS_PER_UNIT};

/// Listing identifier (opaque, generated on creation).
pub type ListingId = Uuid;
/// Transaction identifier (opaque, generated by the coordinator).
pub type TransactionId = Uuid;
/// User identifier resolved by the auth collaborator.
pub type UserId = Uuid;

// ---------------------------------------------------------------------------
// ListingStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a listing.
///
/// `Pending` and `Rejected` are owned by the admin-approval flow and are
/// read-only inputs to the reservation machine. Only `Approved`, `Reserved`
/// and `Sold` participate in reservation transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Pending,
    Approved,
    Reserved,
    Sold,
    Rejected,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Pending => "pending",
            ListingStatus::Approved => "approved",
            ListingStatus::Reserved => "reserved",
            ListingStatus::Sold => "sold",
            ListingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ListingStatus::Pending),
            "approved" => Some(ListingStatus::Approved),
            "reserved" => Some(ListingStatus::Reserved),
            "sold" => Some(ListingStatus::Sold),
            "rejected" => Some(ListingStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a transaction. `Completed` and `Cancelled` are
/// terminal; `Reserved` is the only non-terminal state and at most one
/// `Reserved` transaction may reference a listing at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Reserved,
    Completed,
    Cancelled,
}

impl TransactionStatus {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Reserved => "reserved",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(TransactionStatus::Reserved),
            "completed" => Some(TransactionStatus::Completed),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A sellable item record.
///
/// `active` is a soft-delete flag, orthogonal to `status`: deactivation must
/// be applicable from any status without disturbing the reservation machine.
/// `updated_at` is a monotonically increasing write timestamp and doubles as
/// the optimistic-concurrency version token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: UserId,
    /// Price in integer micros (1 currency unit = 1_000_000 micros).
    pub price_micros: i64,
    pub status: ListingStatus,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A buyer's claim on a listing.
///
/// Created only by the coordinator's reserve operation (or its legacy
/// reconciliation path) and terminated only by complete or cancel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Caller role. `Admin` is a capability, not an identity check: an admin may
/// complete or cancel any reservation without being a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// An authenticated caller as resolved by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self {
            id,
            role: Role::User,
        }
    }

    pub fn admin(id: UserId) -> Self {
        Self {
            id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

/// Emitted on every successful reserve / complete / cancel so external
/// subscribers (notifications, chat) can react without the core knowing
/// about them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub listing_id: ListingId,
    pub transaction_id: TransactionId,
    pub from_status: ListingStatus,
    pub to_status: ListingStatus,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
