//! Reservation coordinator: the atomic check-and-transition engine.
//!
//! # Design
//!
//! Every operation is a bounded read-verify-write loop over the store's
//! conditional-write primitive:
//!
//! 1. Read the listing together with its version token.
//! 2. Verify soft-delete, policy, and the lifecycle transition against that
//!    snapshot.
//! 3. Attempt the paired atomic write, conditioned on the token.
//! 4. On a version conflict or a transient backend fault, back off with
//!    jitter and run the whole cycle again, up to `RetryPolicy::max_attempts`.
//!
//! Exactly one of several racing `reserve` calls on the same listing
//! succeeds; the others observe `Conflict` (retries exhausted) or
//! `InvalidState` (the re-read snapshot shows the listing already
//! `reserved`). No in-process lock is involved; the store's conditional
//! write establishes the total order on state transitions.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use mkt_schemas::{Actor, ListingId, Transaction, TransactionId, TransactionStatus};

use crate::error::CoreError;
use crate::lifecycle::{self, ListingEvent};
use crate::policy;
use crate::retry::RetryPolicy;
use crate::store::{
    ListingRepository, NewTransaction, ReservationStore, StoreError, TransactionRepository,
    VersionedListing,
};

// ---------------------------------------------------------------------------
// ReservationCoordinator
// ---------------------------------------------------------------------------

/// Orchestrates reserve / complete / cancel against an injected store.
///
/// Construction happens once at process startup with the production store;
/// tests inject an in-memory store. The coordinator holds no mutable state
/// of its own and is freely shareable across request handlers.
pub struct ReservationCoordinator {
    store: Arc<dyn ReservationStore>,
    retry: RetryPolicy,
}

impl ReservationCoordinator {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn ReservationStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    // -----------------------------------------------------------------------
    // Reserve
    // -----------------------------------------------------------------------

    /// Reserve an `approved` listing for `buyer`, creating the backing
    /// transaction in the same atomic unit.
    ///
    /// # Errors
    /// `NotFound` for absent or soft-deleted listings, `Forbidden` for
    /// self-purchase, `InvalidState` when the listing is not `approved`,
    /// `Conflict` when concurrent writers exhaust the bounded retries.
    pub async fn reserve(
        &self,
        listing_id: ListingId,
        buyer: &Actor,
    ) -> Result<Transaction, CoreError> {
        if listing_id.is_nil() || buyer.id.is_nil() {
            return Err(CoreError::Validation("nil identifier".to_string()));
        }

        let mut backend = false;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            self.pause_before(attempt, listing_id, "reserve").await;

            let snapshot = match self.snapshot(listing_id, &mut backend).await? {
                Some(s) => s,
                None => continue,
            };
            let listing = &snapshot.listing;

            policy::can_reserve(buyer, listing)?;
            let next = lifecycle::apply(listing.status, ListingEvent::Reserve)
                .map_err(|_| CoreError::InvalidState(listing.status))?;

            let tx = NewTransaction {
                id: Uuid::new_v4(),
                listing_id,
                buyer_id: buyer.id,
                seller_id: listing.seller_id,
                status: TransactionStatus::Reserved,
            };

            match self
                .store
                .reserve_atomic(listing_id, snapshot.token, next, tx)
                .await
            {
                Ok(tx) => {
                    info!(%listing_id, transaction_id = %tx.id, buyer_id = %buyer.id, "reserved");
                    return Ok(tx);
                }
                Err(StoreError::VersionConflict) => {
                    warn!(%listing_id, attempt, "reserve lost the write race");
                    continue;
                }
                Err(StoreError::Backend(msg)) => {
                    warn!(%listing_id, attempt, %msg, "reserve hit a transient storage fault");
                    backend = true;
                    continue;
                }
                // Uniqueness backstop: a reserved row slipped in between our
                // read and write. Final for this request.
                Err(StoreError::DuplicateActive) => {
                    return Err(CoreError::Conflict { backend: false })
                }
                Err(StoreError::NotFound) => return Err(CoreError::NotFound),
            }
        }

        Err(CoreError::Conflict { backend })
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    /// Finalize a reserved sale: listing to `sold`, active transaction to
    /// `completed`.
    ///
    /// When the listing is `reserved` but no transaction row exists (legacy
    /// records predating the reservation engine), one is created directly in
    /// `completed` state. Those rows lost the buyer identity, recorded here
    /// as the nil user.
    pub async fn complete(
        &self,
        listing_id: ListingId,
        actor: &Actor,
    ) -> Result<Transaction, CoreError> {
        if listing_id.is_nil() || actor.id.is_nil() {
            return Err(CoreError::Validation("nil identifier".to_string()));
        }

        let mut backend = false;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            self.pause_before(attempt, listing_id, "complete").await;

            let snapshot = match self.snapshot(listing_id, &mut backend).await? {
                Some(s) => s,
                None => continue,
            };
            let listing = &snapshot.listing;

            policy::can_complete(actor, listing)?;
            let next = lifecycle::apply(listing.status, ListingEvent::Complete)
                .map_err(|_| CoreError::InvalidState(listing.status))?;

            // A transient fault here must retry, never masquerade as the
            // missing-transaction reconciliation case.
            let active = match self.store.find_active_by_listing(listing_id).await {
                Ok(found) => found,
                Err(StoreError::Backend(msg)) => {
                    warn!(%listing_id, attempt, %msg, "transaction read hit a transient storage fault");
                    backend = true;
                    continue;
                }
                Err(_) => return Err(CoreError::Conflict { backend: true }),
            };

            let result = match active {
                Some(active) => {
                    self.store
                        .settle_atomic(
                            listing_id,
                            snapshot.token,
                            next,
                            active.id,
                            TransactionStatus::Completed,
                        )
                        .await
                }
                None => {
                    debug!(%listing_id, "no active transaction; reconciling legacy record");
                    let tx = NewTransaction {
                        id: Uuid::new_v4(),
                        listing_id,
                        buyer_id: Uuid::nil(),
                        seller_id: listing.seller_id,
                        status: TransactionStatus::Completed,
                    };
                    self.store
                        .reserve_atomic(listing_id, snapshot.token, next, tx)
                        .await
                }
            };

            match result {
                Ok(tx) => {
                    info!(%listing_id, transaction_id = %tx.id, actor_id = %actor.id, "completed");
                    return Ok(tx);
                }
                Err(StoreError::VersionConflict) => {
                    warn!(%listing_id, attempt, "complete lost the write race");
                    continue;
                }
                Err(StoreError::Backend(msg)) => {
                    warn!(%listing_id, attempt, %msg, "complete hit a transient storage fault");
                    backend = true;
                    continue;
                }
                Err(StoreError::DuplicateActive) => {
                    return Err(CoreError::Conflict { backend: false })
                }
                Err(StoreError::NotFound) => return Err(CoreError::NotFound),
            }
        }

        Err(CoreError::Conflict { backend })
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Release a reservation: listing back to `approved`, transaction to
    /// `cancelled`.
    ///
    /// Idempotent: when no active transaction exists (already cancelled or
    /// completed-and-superseded duplicate retry from a client), this is a
    /// no-op that returns `Ok(None)`. Returns the released transaction
    /// otherwise.
    pub async fn cancel(
        &self,
        listing_id: ListingId,
        actor: &Actor,
    ) -> Result<Option<Transaction>, CoreError> {
        if listing_id.is_nil() || actor.id.is_nil() {
            return Err(CoreError::Validation("nil identifier".to_string()));
        }

        let mut backend = false;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            self.pause_before(attempt, listing_id, "cancel").await;

            let snapshot = match self.snapshot(listing_id, &mut backend).await? {
                Some(s) => s,
                None => continue,
            };
            let listing = &snapshot.listing;

            // Same discipline as `complete`: a transient fault retries and
            // must not be mistaken for an already-released reservation.
            let active = match self.store.find_active_by_listing(listing_id).await {
                Ok(Some(tx)) => tx,
                Ok(None) => {
                    debug!(%listing_id, "cancel with nothing to release; no-op");
                    return Ok(None);
                }
                Err(StoreError::Backend(msg)) => {
                    warn!(%listing_id, attempt, %msg, "transaction read hit a transient storage fault");
                    backend = true;
                    continue;
                }
                Err(_) => return Err(CoreError::Conflict { backend: true }),
            };

            policy::can_cancel(actor, &active)?;
            let next = lifecycle::apply(listing.status, ListingEvent::Cancel)
                .map_err(|_| CoreError::InvalidState(listing.status))?;

            match self
                .store
                .settle_atomic(
                    listing_id,
                    snapshot.token,
                    next,
                    active.id,
                    TransactionStatus::Cancelled,
                )
                .await
            {
                Ok(tx) => {
                    info!(%listing_id, transaction_id = %tx.id, actor_id = %actor.id, "cancelled");
                    return Ok(Some(tx));
                }
                Err(StoreError::VersionConflict) => {
                    warn!(%listing_id, attempt, "cancel lost the write race");
                    continue;
                }
                Err(StoreError::Backend(msg)) => {
                    warn!(%listing_id, attempt, %msg, "cancel hit a transient storage fault");
                    backend = true;
                    continue;
                }
                Err(StoreError::DuplicateActive) => {
                    return Err(CoreError::Conflict { backend: false })
                }
                Err(StoreError::NotFound) => return Err(CoreError::NotFound),
            }
        }

        Err(CoreError::Conflict { backend })
    }

    // -----------------------------------------------------------------------
    // Transaction reads
    // -----------------------------------------------------------------------

    /// Fetch a transaction if `actor` is a participant or an admin.
    pub async fn transaction(
        &self,
        tx_id: TransactionId,
        actor: &Actor,
    ) -> Result<Transaction, CoreError> {
        // Qualified call: both repositories expose `get` over a Uuid id.
        let tx = TransactionRepository::get(&*self.store, tx_id)
            .await
            .map_err(|e| self.read_failure(e))?
            .ok_or(CoreError::NotFound)?;
        policy::can_view(actor, &tx)?;
        Ok(tx)
    }

    /// The active (`reserved`) transaction for a listing, if any. Same
    /// visibility rule as [`transaction`](Self::transaction).
    pub async fn active_reservation(
        &self,
        listing_id: ListingId,
        actor: &Actor,
    ) -> Result<Option<Transaction>, CoreError> {
        let found = self
            .store
            .find_active_by_listing(listing_id)
            .await
            .map_err(|e| self.read_failure(e))?;
        match found {
            Some(tx) => {
                policy::can_view(actor, &tx)?;
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Jittered backoff before every attempt after the first.
    async fn pause_before(&self, attempt: u32, listing_id: ListingId, op: &str) {
        if attempt > 1 {
            let delay = self.retry.backoff_with_jitter(attempt - 1);
            debug!(%listing_id, op, attempt, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }

    /// Read the listing snapshot, folding soft-deletes into `NotFound` and
    /// transient read faults into a retry (`Ok(None)`).
    async fn snapshot(
        &self,
        listing_id: ListingId,
        backend: &mut bool,
    ) -> Result<Option<VersionedListing>, CoreError> {
        match ListingRepository::get(&*self.store, listing_id).await {
            Ok(Some(s)) if !s.listing.active => Err(CoreError::NotFound),
            Ok(Some(s)) => Ok(Some(s)),
            Ok(None) => Err(CoreError::NotFound),
            Err(StoreError::Backend(msg)) => {
                warn!(%listing_id, %msg, "listing read hit a transient storage fault");
                *backend = true;
                Ok(None)
            }
            Err(StoreError::NotFound) => Err(CoreError::NotFound),
            Err(_) => Err(CoreError::Conflict { backend: true }),
        }
    }

    fn read_failure(&self, e: StoreError) -> CoreError {
        match e {
            StoreError::NotFound => CoreError::NotFound,
            other => {
                warn!(error = %other, "transaction read failed");
                CoreError::Conflict { backend: true }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRefusal;
    use crate::store::VersionToken;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use mkt_schemas::{Listing, ListingStatus, UserId, MICROS_PER_UNIT};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted store: one listing, a transaction log, and fault counters
    /// that make the next N operations fail in a chosen way.
    #[derive(Default)]
    struct StubStore {
        listing: Mutex<Option<Listing>>,
        txs: Mutex<Vec<Transaction>>,
        /// Next N `reserve_atomic`/`settle_atomic` calls fail VersionConflict.
        write_conflicts: AtomicU32,
        /// Next N listing reads fail with a transient backend fault.
        read_faults: AtomicU32,
        /// Next N active-transaction lookups fail with a transient fault.
        find_faults: AtomicU32,
    }

    impl StubStore {
        fn with_listing(listing: Listing) -> Self {
            Self {
                listing: Mutex::new(Some(listing)),
                ..Default::default()
            }
        }

        fn take_fault(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn touch(listing: &mut Listing, status: ListingStatus) {
            listing.status = status;
            // The clock may not tick between writes; force the token forward.
            listing.updated_at =
                Utc::now().max(listing.updated_at + ChronoDuration::microseconds(1));
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
    impl ListingRepository for StubStore {
        async fn get(&self, id: ListingId) -> Result<Option<VersionedListing>, StoreError> {
            if Self::take_fault(&self.read_faults) {
                return Err(StoreError::Backend("scripted read fault".to_string()));
            }
            let guard = self.listing.lock().unwrap();
            Ok(guard.as_ref().filter(|l| l.id == id).map(|l| VersionedListing {
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
            let mut guard = self.listing.lock().unwrap();
            let listing = guard
                .as_mut()
                .filter(|l| l.id == id)
                .ok_or(StoreError::NotFound)?;
            if VersionToken(listing.updated_at) != token {
                return Err(StoreError::VersionConflict);
            }
            Self::touch(listing, status);
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionRepository for StubStore {
        async fn create(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
            let mut stored = Transaction {
                id: tx.id,
                listing_id: tx.listing_id,
                buyer_id: tx.buyer_id,
                seller_id: tx.seller_id,
                status: TransactionStatus::Reserved,
                created_at: Utc::now(),
                completed_at: None,
                cancelled_at: None,
            };
            Self::stamp(&mut stored, tx.status);
            self.txs.lock().unwrap().push(stored.clone());
            Ok(stored)
        }

        async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
            Ok(self.txs.lock().unwrap().iter().find(|t| t.id == id).cloned())
        }

        async fn find_active_by_listing(
            &self,
            listing_id: ListingId,
        ) -> Result<Option<Transaction>, StoreError> {
            if Self::take_fault(&self.find_faults) {
                return Err(StoreError::Backend("scripted lookup fault".to_string()));
            }
            Ok(self
                .txs
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.listing_id == listing_id && t.status == TransactionStatus::Reserved)
                .cloned())
        }

        async fn update_status(
            &self,
            id: TransactionId,
            status: TransactionStatus,
        ) -> Result<Transaction, StoreError> {
            let mut guard = self.txs.lock().unwrap();
            let tx = guard
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StoreError::NotFound)?;
            Self::stamp(tx, status);
            Ok(tx.clone())
        }
    }

    #[async_trait]
    impl ReservationStore for StubStore {
        async fn reserve_atomic(
            &self,
            listing_id: ListingId,
            token: VersionToken,
            status: ListingStatus,
            tx: NewTransaction,
        ) -> Result<Transaction, StoreError> {
            if Self::take_fault(&self.write_conflicts) {
                return Err(StoreError::VersionConflict);
            }
            self.conditional_update(listing_id, token, status).await?;
            self.create(tx).await
        }

        async fn settle_atomic(
            &self,
            listing_id: ListingId,
            token: VersionToken,
            status: ListingStatus,
            tx_id: TransactionId,
            tx_status: TransactionStatus,
        ) -> Result<Transaction, StoreError> {
            if Self::take_fault(&self.write_conflicts) {
                return Err(StoreError::VersionConflict);
            }
            self.conditional_update(listing_id, token, status).await?;
            self.update_status(tx_id, tx_status).await
        }
    }

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn approved_listing(seller: UserId) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            seller_id: seller,
            price_micros: 199 * MICROS_PER_UNIT,
            status: ListingStatus::Approved,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_micros(100),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn coordinator(store: StubStore) -> (ReservationCoordinator, Arc<StubStore>) {
        let store = Arc::new(store);
        let shared: Arc<dyn ReservationStore> = store.clone();
        (ReservationCoordinator::with_retry(shared, fast_retry()), store)
    }

    // -----------------------------------------------------------------------
    // Reserve
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn reserve_flips_listing_and_creates_backing_transaction() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        let tx = coord.reserve(listing_id, &buyer).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Reserved);
        assert_eq!(tx.buyer_id, buyer.id);
        assert_eq!(tx.seller_id, seller);
        let stored = store.listing.lock().unwrap().clone().unwrap();
        assert_eq!(stored.status, ListingStatus::Reserved);
    }

    #[tokio::test]
    async fn reserve_rejects_self_purchase() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        let err = coord.reserve(listing_id, &Actor::user(seller)).await.unwrap_err();
        assert_eq!(err, CoreError::Forbidden(PolicyRefusal::SelfPurchase));
    }

    #[tokio::test]
    async fn reserve_requires_approved_status() {
        let mut listing = approved_listing(Uuid::new_v4());
        listing.status = ListingStatus::Pending;
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        let err = coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::InvalidState(ListingStatus::Pending));
    }

    #[tokio::test]
    async fn reserve_treats_missing_and_soft_deleted_as_not_found() {
        let (coord, _) = coordinator(StubStore::default());
        let err = coord
            .reserve(Uuid::new_v4(), &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::NotFound);

        let mut listing = approved_listing(Uuid::new_v4());
        listing.active = false;
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));
        let err = coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::NotFound);
    }

    #[tokio::test]
    async fn reserve_rejects_nil_identifiers() {
        let (coord, _) = coordinator(StubStore::default());
        let err = coord
            .reserve(Uuid::nil(), &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn reserve_retries_version_conflicts_then_succeeds() {
        let listing = approved_listing(Uuid::new_v4());
        let listing_id = listing.id;
        let store = StubStore::with_listing(listing);
        store.write_conflicts.store(2, Ordering::SeqCst);
        let (coord, store) = coordinator(store);

        let tx = coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Reserved);
        assert_eq!(store.write_conflicts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reserve_exhausts_retries_into_conflict() {
        let listing = approved_listing(Uuid::new_v4());
        let listing_id = listing.id;
        let store = StubStore::with_listing(listing);
        store.write_conflicts.store(u32::MAX, Ordering::SeqCst);
        let (coord, _) = coordinator(store);

        let err = coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Conflict { backend: false });
    }

    #[tokio::test]
    async fn transient_read_faults_surface_as_backend_conflict() {
        let listing = approved_listing(Uuid::new_v4());
        let listing_id = listing.id;
        let store = StubStore::with_listing(listing);
        store.read_faults.store(u32::MAX, Ordering::SeqCst);
        let (coord, _) = coordinator(store);

        let err = coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Conflict { backend: true });
    }

    // -----------------------------------------------------------------------
    // Complete
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn complete_settles_listing_and_transaction() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        coord.reserve(listing_id, &buyer).await.unwrap();
        let tx = coord.complete(listing_id, &Actor::user(seller)).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.completed_at.is_some());
        let stored = store.listing.lock().unwrap().clone().unwrap();
        assert_eq!(stored.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn complete_requires_seller_or_admin() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap();
        let err = coord
            .complete(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Forbidden(PolicyRefusal::NotSellerOrAdmin));

        // Admin capability clears the same check.
        let tx = coord
            .complete(listing_id, &Actor::admin(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn complete_reconciles_legacy_record_without_transaction() {
        let seller = Uuid::new_v4();
        let mut listing = approved_listing(seller);
        listing.status = ListingStatus::Reserved; // legacy row, no transaction
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let tx = coord.complete(listing_id, &Actor::user(seller)).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.buyer_id.is_nil(), "legacy rows lost the buyer identity");
        let stored = store.listing.lock().unwrap().clone().unwrap();
        assert_eq!(stored.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn complete_on_approved_listing_is_invalid_state() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        let err = coord.complete(listing_id, &Actor::user(seller)).await.unwrap_err();
        assert_eq!(err, CoreError::InvalidState(ListingStatus::Approved));
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_restores_approved_and_is_idempotent() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        coord.reserve(listing_id, &buyer).await.unwrap();

        let released = coord.cancel(listing_id, &buyer).await.unwrap();
        let released = released.expect("first cancel releases the reservation");
        assert_eq!(released.status, TransactionStatus::Cancelled);
        assert!(released.cancelled_at.is_some());
        let stored = store.listing.lock().unwrap().clone().unwrap();
        assert_eq!(stored.status, ListingStatus::Approved);

        // Duplicate client retry: success, nothing to release.
        let again = coord.cancel(listing_id, &buyer).await.unwrap();
        assert!(again.is_none());
        let stored = store.listing.lock().unwrap().clone().unwrap();
        assert_eq!(stored.status, ListingStatus::Approved);
    }

    #[tokio::test]
    async fn cancel_requires_participant_or_admin() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        coord
            .reserve(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap();
        let err = coord
            .cancel(listing_id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Forbidden(PolicyRefusal::NotParticipant));

        assert!(coord
            .cancel(listing_id, &Actor::admin(Uuid::new_v4()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn flaky_lookup_never_fakes_an_idempotent_cancel() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        coord.reserve(listing_id, &buyer).await.unwrap();

        // Every lookup fails: cancel must report the exhaustion, not claim
        // there was nothing to release.
        store.find_faults.store(u32::MAX, Ordering::SeqCst);
        let err = coord.cancel(listing_id, &buyer).await.unwrap_err();
        assert_eq!(err, CoreError::Conflict { backend: true });

        // The reservation is still intact.
        store.find_faults.store(0, Ordering::SeqCst);
        let released = coord.cancel(listing_id, &buyer).await.unwrap();
        assert!(released.is_some());
    }

    #[tokio::test]
    async fn flaky_lookup_never_triggers_legacy_reconciliation() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, store) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        let reserved = coord.reserve(listing_id, &buyer).await.unwrap();

        store.find_faults.store(u32::MAX, Ordering::SeqCst);
        let err = coord
            .complete(listing_id, &Actor::user(seller))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Conflict { backend: true });

        store.find_faults.store(0, Ordering::SeqCst);
        let done = coord
            .complete(listing_id, &Actor::user(seller))
            .await
            .unwrap();
        assert_eq!(done.id, reserved.id, "the real transaction settles, no orphan row");
        assert_eq!(store.txs.lock().unwrap().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transaction_read_is_participant_or_admin_only() {
        let seller = Uuid::new_v4();
        let listing = approved_listing(seller);
        let listing_id = listing.id;
        let (coord, _) = coordinator(StubStore::with_listing(listing));

        let buyer = Actor::user(Uuid::new_v4());
        let tx = coord.reserve(listing_id, &buyer).await.unwrap();

        assert!(coord.transaction(tx.id, &buyer).await.is_ok());
        assert!(coord.transaction(tx.id, &Actor::user(seller)).await.is_ok());
        assert!(coord.transaction(tx.id, &Actor::admin(Uuid::new_v4())).await.is_ok());
        let err = coord
            .transaction(tx.id, &Actor::user(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Forbidden(PolicyRefusal::NotParticipant));

        let active = coord.active_reservation(listing_id, &buyer).await.unwrap();
        assert_eq!(active.map(|t| t.id), Some(tx.id));
    }
}
