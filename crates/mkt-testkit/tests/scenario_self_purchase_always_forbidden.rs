//! Sellers can never reserve their own listings, whatever the listing's
//! lifecycle status and whatever capability the actor carries.

use std::sync::Arc;

use mkt_reserve::{CoreError, PolicyRefusal, ReservationCoordinator, ReservationStore};
use mkt_schemas::{Actor, ListingStatus};
use mkt_testkit::{listing_with_status, MemStore};
use uuid::Uuid;

#[tokio::test]
async fn self_purchase_fails_forbidden_in_every_status() {
    let store = Arc::new(MemStore::new());
    let shared: Arc<dyn ReservationStore> = store.clone();
    let coord = ReservationCoordinator::new(shared);

    let seller = Uuid::new_v4();
    for status in [
        ListingStatus::Pending,
        ListingStatus::Approved,
        ListingStatus::Reserved,
        ListingStatus::Sold,
        ListingStatus::Rejected,
    ] {
        let listing_id = store.insert_listing(listing_with_status(seller, status));

        let err = coord
            .reserve(listing_id, &Actor::user(seller))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::Forbidden(PolicyRefusal::SelfPurchase),
            "self-purchase must be forbidden while {status}, not invalid-state"
        );

        // The admin capability does not bypass the self-dealing rule.
        let err = coord
            .reserve(listing_id, &Actor::admin(seller))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Forbidden(PolicyRefusal::SelfPurchase));
    }
}
