//! Request and response types for all mkt-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use mkt_schemas::{ListingId, Transaction, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Uniform error body. `kind` selects the failure taxonomy bucket
/// ("not_found" | "forbidden" | "invalid_state" | "conflict" | "validation");
/// `backend` marks a conflict whose retries drowned in transient storage
/// faults rather than version races.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<bool>,
}

// ---------------------------------------------------------------------------
// POST /v1/reservations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub listing_id: ListingId,
    pub buyer_id: UserId,
}

/// Body for complete / cancel. The auth collaborator has already resolved
/// the caller; `is_admin` carries the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleRequest {
    pub actor_id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction: Transaction,
}

/// Cancellation returns an empty object; duplicate retries get the same
/// success shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelResponse {}

// ---------------------------------------------------------------------------
// GET /v1/transactions/{id}
// ---------------------------------------------------------------------------

/// Actor identity for read endpoints, passed as query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorQuery {
    pub actor_id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}
