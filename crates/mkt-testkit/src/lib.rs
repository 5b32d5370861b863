//! Deterministic test support for the reservation core.
//!
//! [`MemStore`] is an in-memory [`ReservationStore`]: every operation runs
//! under one mutex, so the paired atomic units are atomic by construction,
//! while the version-token checks still expose the read-to-write race the
//! coordinator must survive. No network I/O, no randomness beyond ids.
//!
//! Also provides listing builders and the invariant checker used across the
//! scenario tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use mkt_reserve::{
    ListingRepository, NewTransaction, ReservationStore, StoreError, TransactionRepository,
    VersionToken, VersionedListing,
};
use mkt_schemas::{
    Listing, ListingId, ListingStatus, Transaction, TransactionId, TransactionStatus, UserId,
    MICROS_PER_UNIT,
};

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    listings: HashMap<ListingId, Listing>,
    transactions: HashMap<TransactionId, Transaction>,
}

/// In-memory reservation store.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a listing row (catalog-collaborator stand-in).
    pub fn insert_listing(&self, listing: Listing) -> ListingId {
        let id = listing.id;
        self.lock_for_seed().listings.insert(id, listing);
        id
    }

    /// Snapshot accessor for assertions.
    pub fn listing(&self, id: ListingId) -> Option<Listing> {
        self.lock_for_seed().listings.get(&id).cloned()
    }

    /// All transactions referencing a listing, in no particular order.
    pub fn transactions_for(&self, listing_id: ListingId) -> Vec<Transaction> {
        self.lock_for_seed()
            .transactions
            .values()
            .filter(|t| t.listing_id == listing_id)
            .cloned()
            .collect()
    }

    fn lock_for_seed(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("test store mutex poisoned")
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("test store mutex poisoned".to_string()))
    }

    /// Advance the version token. The wall clock may not tick between two
    /// writes, so force strict growth.
    fn touch(listing: &mut Listing, status: ListingStatus) {
        listing.status = status;
        listing.updated_at = Utc::now().max(listing.updated_at + Duration::microseconds(1));
    }

    fn materialize(tx: NewTransaction) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: tx.id,
            listing_id: tx.listing_id,
            buyer_id: tx.buyer_id,
            seller_id: tx.seller_id,
            status: tx.status,
            created_at: now,
            completed_at: (tx.status == TransactionStatus::Completed).then_some(now),
            cancelled_at: None,
        }
    }

    fn stamp(tx: &mut Transaction, status: TransactionStatus) {
        tx.status = status;
        match status {
            TransactionStatus::Completed => tx.completed_at = Some(Utc::now()),
            TransactionStatus::Cancelled => tx.cancelled_at = Some(Utc::now()),
            TransactionStatus::Reserved => {}
        }
    }
}

#[async_trait]
impl ListingRepository for MemStore {
    async fn get(&self, id: ListingId) -> Result<Option<VersionedListing>, StoreError> {
        let guard = self.lock()?;
        Ok(guard.listings.get(&id).map(|l| VersionedListing {
            token: VersionToken(l.updated_at),
            listing: l.clone(),
        }))
    }

    async fn conditional_update(
        &self,
        id: ListingId,
        token: VersionToken,
        status: ListingStatus,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let listing = guard.listings.get_mut(&id).ok_or(StoreError::NotFound)?;
        if VersionToken(listing.updated_at) != token {
            return Err(StoreError::VersionConflict);
        }
        Self::touch(listing, status);
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MemStore {
    async fn create(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        let mut guard = self.lock()?;
        if tx.status == TransactionStatus::Reserved
            && guard
                .transactions
                .values()
                .any(|t| t.listing_id == tx.listing_id && t.status == TransactionStatus::Reserved)
        {
            return Err(StoreError::DuplicateActive);
        }
        let stored = Self::materialize(tx);
        guard.transactions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let guard = self.lock()?;
        Ok(guard.transactions.get(&id).cloned())
    }

    async fn find_active_by_listing(
        &self,
        listing_id: ListingId,
    ) -> Result<Option<Transaction>, StoreError> {
        let guard = self.lock()?;
        Ok(guard
            .transactions
            .values()
            .find(|t| t.listing_id == listing_id && t.status == TransactionStatus::Reserved)
            .cloned())
    }

    async fn update_status(
        &self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<Transaction, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard
            .transactions
            .get_mut(&id)
            .ok_or(StoreError::NotFound)?;
        Self::stamp(tx, status);
        Ok(tx.clone())
    }
}

#[async_trait]
impl ReservationStore for MemStore {
    async fn reserve_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let mut guard = self.lock()?;

        let duplicate = tx.status == TransactionStatus::Reserved
            && guard
                .transactions
                .values()
                .any(|t| t.listing_id == listing_id && t.status == TransactionStatus::Reserved);

        let listing = guard
            .listings
            .get_mut(&listing_id)
            .ok_or(StoreError::NotFound)?;
        if VersionToken(listing.updated_at) != token {
            return Err(StoreError::VersionConflict);
        }
        if duplicate {
            return Err(StoreError::DuplicateActive);
        }
        Self::touch(listing, status);

        let stored = Self::materialize(tx);
        guard.transactions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn settle_atomic(
        &self,
        listing_id: ListingId,
        token: VersionToken,
        status: ListingStatus,
        tx_id: TransactionId,
        tx_status: TransactionStatus,
    ) -> Result<Transaction, StoreError> {
        let mut guard = self.lock()?;

        // Both halves must be possible before either is applied.
        if !guard.transactions.contains_key(&tx_id) {
            return Err(StoreError::NotFound);
        }
        let listing = guard
            .listings
            .get_mut(&listing_id)
            .ok_or(StoreError::NotFound)?;
        if VersionToken(listing.updated_at) != token {
            return Err(StoreError::VersionConflict);
        }
        Self::touch(listing, status);

        let tx = guard
            .transactions
            .get_mut(&tx_id)
            .ok_or(StoreError::NotFound)?;
        Self::stamp(tx, tx_status);
        Ok(tx.clone())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// An active, `approved` listing ready to be reserved.
pub fn approved_listing(seller_id: UserId) -> Listing {
    listing_with_status(seller_id, ListingStatus::Approved)
}

pub fn listing_with_status(seller_id: UserId, status: ListingStatus) -> Listing {
    let now = Utc::now();
    Listing {
        id: Uuid::new_v4(),
        seller_id,
        price_micros: 180 * MICROS_PER_UNIT,
        status,
        active: true,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Invariant checker
// ---------------------------------------------------------------------------

/// Assert the core consistency invariant for one listing:
/// `status ∈ {reserved, sold}` iff exactly one transaction referencing it
/// has `status ∈ {reserved, completed}`, and never more than one.
pub fn assert_reservation_invariant(store: &MemStore, listing_id: ListingId) {
    let listing = store
        .listing(listing_id)
        .expect("invariant check on unknown listing");
    let claims: Vec<Transaction> = store
        .transactions_for(listing_id)
        .into_iter()
        .filter(|t| {
            matches!(
                t.status,
                TransactionStatus::Reserved | TransactionStatus::Completed
            )
        })
        .collect();

    assert!(
        claims.len() <= 1,
        "listing {listing_id} has {} concurrent claims",
        claims.len()
    );

    let claimed = matches!(
        listing.status,
        ListingStatus::Reserved | ListingStatus::Sold
    );
    assert_eq!(
        claimed,
        claims.len() == 1,
        "listing {listing_id} status {} does not match its {} claim rows",
        listing.status,
        claims.len()
    );
}

// ---------------------------------------------------------------------------
// Port-contract unit tests
// ---------------------------------------------------------------------------
