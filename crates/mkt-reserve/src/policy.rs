//! Policy guard: pure actor-authorization predicates.
//!
//! Every coordinator operation asks this module whether the actor may invoke
//! it; nothing else in the system makes permission decisions. Centralizing
//! the checks keeps the owner-or-admin rules from being re-implemented ad
//! hoc in every route handler.
//!
//! All functions are pure and perform no I/O. A denial carries the reason so
//! the caller can select the right error kind.

use mkt_schemas::{Actor, Listing, Transaction};

// ---------------------------------------------------------------------------
// PolicyRefusal
// ---------------------------------------------------------------------------

/// The reason an operation was denied for an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRefusal {
    /// Buyer attempted to reserve their own listing.
    SelfPurchase,
    /// Only the listing's seller or an admin may complete a sale.
    NotSellerOrAdmin,
    /// Only the transaction's buyer, the seller, or an admin may touch it.
    NotParticipant,
}

impl std::fmt::Display for PolicyRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyRefusal::SelfPurchase => {
                write!(f, "POLICY_REFUSED: cannot reserve your own listing")
            }
            PolicyRefusal::NotSellerOrAdmin => {
                write!(f, "POLICY_REFUSED: only the seller or an admin may complete")
            }
            PolicyRefusal::NotParticipant => {
                write!(f, "POLICY_REFUSED: only a participant or an admin")
            }
        }
    }
}

impl std::error::Error for PolicyRefusal {}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// May `actor` reserve `listing`?
///
/// Self-dealing is refused regardless of listing state or role: even an
/// admin cannot buy from themselves.
pub fn can_reserve(actor: &Actor, listing: &Listing) -> Result<(), PolicyRefusal> {
    if actor.id == listing.seller_id {
        return Err(PolicyRefusal::SelfPurchase);
    }
    Ok(())
}

/// May `actor` complete the sale of `listing`? Seller or admin only.
pub fn can_complete(actor: &Actor, listing: &Listing) -> Result<(), PolicyRefusal> {
    if actor.is_admin() || actor.id == listing.seller_id {
        Ok(())
    } else {
        Err(PolicyRefusal::NotSellerOrAdmin)
    }
}

/// May `actor` cancel `transaction`? Buyer, seller, or admin.
pub fn can_cancel(actor: &Actor, transaction: &Transaction) -> Result<(), PolicyRefusal> {
    if actor.is_admin()
        || actor.id == transaction.buyer_id
        || actor.id == transaction.seller_id
    {
        Ok(())
    } else {
        Err(PolicyRefusal::NotParticipant)
    }
}

/// May `actor` read `transaction`? Same circle as cancellation: the buyer,
/// the seller, or an admin.
pub fn can_view(actor: &Actor, transaction: &Transaction) -> Result<(), PolicyRefusal> {
    can_cancel(actor, transaction)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
