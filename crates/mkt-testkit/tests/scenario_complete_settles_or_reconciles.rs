//! Completion: the primary path settles the active transaction; the
//! compatibility path reconciles legacy reserved listings that lost their
//! transaction row.

use std::sync::Arc;

use mkt_reserve::{CoreError, PolicyRefusal, ReservationCoordinator, ReservationStore};
use mkt_schemas::{Actor, ListingStatus, TransactionStatus};
use mkt_testkit::{
    approved_listing, assert_reservation_invariant, listing_with_status, MemStore,
};
use uuid::Uuid;

fn harness() -> (Arc<MemStore>, ReservationCoordinator) {
    let store = Arc::new(MemStore::new());
    let shared: Arc<dyn ReservationStore> = store.clone();
    (store, ReservationCoordinator::new(shared))
}

#[tokio::test]
async fn seller_completes_a_reserved_sale() {
    let (store, coord) = harness();
    let seller = Uuid::new_v4();
    let listing_id = store.insert_listing(approved_listing(seller));

    let buyer = Actor::user(Uuid::new_v4());
    let reserved = coord.reserve(listing_id, &buyer).await.unwrap();

    let done = coord
        .complete(listing_id, &Actor::user(seller))
        .await
        .unwrap();
    assert_eq!(done.id, reserved.id, "the active transaction is settled");
    assert_eq!(done.status, TransactionStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(store.listing(listing_id).unwrap().status, ListingStatus::Sold);
    assert_reservation_invariant(&store, listing_id);
}

#[tokio::test]
async fn stranger_cannot_complete_admin_can() {
    let (store, coord) = harness();
    let seller = Uuid::new_v4();
    let listing_id = store.insert_listing(approved_listing(seller));
    coord
        .reserve(listing_id, &Actor::user(Uuid::new_v4()))
        .await
        .unwrap();

    let err = coord
        .complete(listing_id, &Actor::user(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::Forbidden(PolicyRefusal::NotSellerOrAdmin));

    coord
        .complete(listing_id, &Actor::admin(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(store.listing(listing_id).unwrap().status, ListingStatus::Sold);
    assert_reservation_invariant(&store, listing_id);
}

#[tokio::test]
async fn legacy_reserved_listing_without_transaction_is_reconciled() {
    let (store, coord) = harness();
    let seller = Uuid::new_v4();
    // Predates the reservation engine: reserved, but no transaction row.
    let listing_id = store.insert_listing(listing_with_status(seller, ListingStatus::Reserved));
    assert!(store.transactions_for(listing_id).is_empty());

    let done = coord
        .complete(listing_id, &Actor::user(seller))
        .await
        .unwrap();
    assert_eq!(done.status, TransactionStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(
        done.buyer_id.is_nil(),
        "legacy rows lost the buyer identity and record the nil user"
    );
    assert_eq!(store.listing(listing_id).unwrap().status, ListingStatus::Sold);
    assert_reservation_invariant(&store, listing_id);
}

#[tokio::test]
async fn completing_an_unreserved_listing_is_invalid_state() {
    let (store, coord) = harness();
    let seller = Uuid::new_v4();
    let listing_id = store.insert_listing(approved_listing(seller));

    let err = coord
        .complete(listing_id, &Actor::user(seller))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::InvalidState(ListingStatus::Approved));

    // Sold is terminal: completing twice fails the same way.
    coord
        .reserve(listing_id, &Actor::user(Uuid::new_v4()))
        .await
        .unwrap();
    coord
        .complete(listing_id, &Actor::user(seller))
        .await
        .unwrap();
    let err = coord
        .complete(listing_id, &Actor::user(seller))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::InvalidState(ListingStatus::Sold));
}

#[tokio::test]
async fn completing_a_missing_listing_is_not_found() {
    let (_store, coord) = harness();
    let err = coord
        .complete(Uuid::new_v4(), &Actor::admin(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::NotFound);
}
