//! Core error taxonomy.
//!
//! The coordinator resolves every failure locally into one of these kinds
//! and never leaks raw storage errors. Nothing here is fatal to the
//! process; every failure is per-request and recoverable by the caller
//! retrying or correcting state.

use mkt_schemas::ListingStatus;

use crate::policy::PolicyRefusal;

/// Failure kinds surfaced by coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Listing or transaction absent, or soft-deleted.
    NotFound,
    /// The policy guard denied the actor.
    Forbidden(PolicyRefusal),
    /// A precondition on the listing status failed (e.g. reserving a
    /// listing that is no longer `approved`). Carries the observed status.
    InvalidState(ListingStatus),
    /// Optimistic-concurrency retries exhausted. `backend` is true when the
    /// exhaustion involved transient storage faults rather than pure
    /// version races; it exists for observability only.
    Conflict { backend: bool },
    /// Malformed input that no storage round-trip could repair.
    Validation(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::NotFound => write!(f, "not found"),
            CoreError::Forbidden(refusal) => write!(f, "forbidden: {refusal}"),
            CoreError::InvalidState(status) => {
                write!(f, "invalid state: listing is {status}")
            }
            CoreError::Conflict { backend: false } => {
                write!(f, "conflict: concurrent writers exhausted retries")
            }
            CoreError::Conflict { backend: true } => {
                write!(f, "conflict: storage faults exhausted retries")
            }
            CoreError::Validation(msg) => write!(f, "validation: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<PolicyRefusal> for CoreError {
    fn from(refusal: PolicyRefusal) -> Self {
        CoreError::Forbidden(refusal)
    }
}
