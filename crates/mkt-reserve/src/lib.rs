//! mkt-reserve
//!
//! The reservation-and-sale consistency engine. Moves a listing through
//! `approved -> reserved -> sold` (or back to `approved` on cancellation)
//! while guaranteeing that a listing is never concurrently reserved or sold
//! to two different buyers, and that every reservation is backed by exactly
//! one transaction record.
//!
//! Correctness rests on the storage layer's atomic conditional-write
//! primitive (optimistic concurrency control), not on in-process locks: the
//! service may run as multiple independent processes with no shared memory.
//!
//! Layout:
//! - `lifecycle`   - explicit (state, event) transition table for listings
//! - `policy`      - pure actor-authorization predicates, no I/O
//! - `store`       - repository ports the storage layer must implement
//! - `retry`       - bounded retry with jittered exponential backoff
//! - `coordinator` - the read-verify-write loop tying it all together

mod coordinator;
mod error;
mod lifecycle;
mod retry;
mod store;

pub mod policy;

pub use coordinator::ReservationCoordinator;
pub use error::CoreError;
pub use lifecycle::{ListingEvent, TransitionError};
pub use policy::PolicyRefusal;
pub use retry::RetryPolicy;
pub use store::{
    ListingRepository, NewTransaction, ReservationStore, StoreError, TransactionRepository,
    VersionToken, VersionedListing,
};
