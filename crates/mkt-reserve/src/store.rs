//! Repository ports the storage layer must implement.
//!
//! The coordinator talks to storage exclusively through these traits. Two
//! narrow repositories cover reads and single-record writes; the combined
//! [`ReservationStore`] adds the one hard infrastructural requirement: the
//! paired listing-update + transaction-write must be a single atomic unit
//! (both succeed or both fail).
//!
//! Implementations: `mkt-db::PgStore` (PostgreSQL) in production,
//! `mkt-testkit::MemStore` (single-lock in-memory map) in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mkt_schemas::{
    Listing, ListingId, ListingStatus, Transaction, TransactionId, TransactionStatus, UserId,
};

// ---------------------------------------------------------------------------
// VersionToken
// ---------------------------------------------------------------------------

/// Opaque optimistic-concurrency token captured when a listing is read.
///
/// Conditional writes succeed only while the listing's `updated_at` still
/// equals the token; any interleaved write invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionToken(pub DateTime<Utc>);

/// A listing snapshot paired with the version token it was read under.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedListing {
    pub listing: Listing,
    pub token: VersionToken,
}

// ---------------------------------------------------------------------------
// NewTransaction
// ---------------------------------------------------------------------------

/// Insert payload for a transaction row. The store stamps `created_at` (and
/// `completed_at` when `status` is already terminal, which happens only on
/// the legacy reconciliation path).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub id: TransactionId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub status: TransactionStatus,
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failures surfaced by repository implementations.
///
/// `VersionConflict` and `Backend` are retryable: the former means another
/// writer won the race, the latter a transient storage fault (network,
/// timeout). Everything else is final for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Target record does not exist.
    NotFound,
    /// The version token no longer matches; another writer interleaved.
    VersionConflict,
    /// The storage-level uniqueness backstop rejected a second active
    /// transaction for the same listing.
    DuplicateActive,
    /// Transient storage fault; safe to retry the whole cycle.
    Backend(String),
}

impl StoreError {
    /// Whether the coordinator may retry the read-verify-write cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict | StoreError::Backend(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "store: record not found"),
            StoreError::VersionConflict => write!(f, "store: version token mismatch"),
            StoreError::DuplicateActive => {
                write!(f, "store: an active transaction already references this listing")
            }
            StoreError::Backend(msg) => write!(f, "store: backend failure: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Repository ports
// ---------------------------------------------------------------------------

/// Read and conditionally update listing records.
///
/// The coordinator is the sole writer of `status` transitions into and out
/// of `reserved`/`sold`; seller-initiated field edits flow through the
/// catalog collaborator, never through this port.
#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Fetch a listing together with its current version token.
    /// Returns `Ok(None)` when the listing does not exist.
    async fn get(&self, id: ListingId) -> Result<Option<VersionedListing>, StoreError>;

    /// Set the listing status only if `token` still matches.
    ///
    /// # Errors
    /// [`StoreError::VersionConflict`] when another writer interleaved,
    /// [`StoreError::NotFound`] when the listing vanished.
    async fn conditional_update(
        &self,
        id: ListingId,
        token: VersionToken,
        status: ListingStatus,
    ) -> Result<(), StoreError>;
}

/// Create, read and settle transaction records.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn create(&self, tx: NewTransaction) -> Result<Transaction, StoreError>;

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// The at-most-one non-terminal (`reserved`) transaction for a listing.
    async fn find_active_by_listing(
        &self,
        listing_id: ListingId,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Move a transaction to `status`, stamping `completed_at` or
    /// `cancelled_at` for terminal targets.
    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction, StoreError>;
}

// ---------------------------------------------------------------------------
// ReservationStore
// ---------------------------------------------------------------------------

/// The combined storage handle the coordinator operates on.
///
/// Beyond the two repositories, implementations must provide the two paired
/// writes as indivisible units. A partially applied pair (listing flipped
/// but no transaction row, or vice versa) must be impossible.
#[async_trait]
pub trait ReservationStore: ListingRepository + TransactionRepository {
    /// Atomically: conditional listing update to `status` + insert `tx`.
    /// Returns the inserted transaction as stored.
    async fn reserve_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError>;

    /// Atomically: conditional listing update to `status` + move the
    /// transaction `tx_id` to `tx_status`. Returns the updated transaction.
    async fn settle_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx_id: TransactionId,
        tx_status: TransactionStatus,
    ) -> Result<Transaction, StoreError>;
}
