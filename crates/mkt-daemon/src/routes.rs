//! Axum router and all HTTP handlers for mkt-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! Status mapping: NotFound -> 404, Forbidden -> 403, InvalidState -> 422,
//! Conflict -> 409, Validation -> 400. The coordinator never leaks raw
//! storage errors, so nothing here maps to 500 on the happy paths.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use mkt_reserve::CoreError;
use mkt_schemas::{Actor, DomainEvent, ListingId, ListingStatus, TransactionId, UserId};

use crate::{
    api_types::{
        ActorQuery, CancelResponse, ErrorResponse, HealthResponse, ReserveRequest, SettleRequest,
        TransactionResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/reservations", post(reserve))
        .route("/v1/reservations/:listing_id/complete", post(complete))
        .route("/v1/reservations/:listing_id/cancel", post(cancel))
        .route("/v1/reservations/:listing_id", get(active_reservation))
        .route("/v1/transactions/:transaction_id", get(transaction))
        .with_state(state)
}

fn actor_from(id: UserId, is_admin: bool) -> Actor {
    if is_admin {
        Actor::admin(id)
    } else {
        Actor::user(id)
    }
}

/// Map a core failure onto the wire taxonomy.
fn error_response(e: CoreError) -> Response {
    let (status, kind, backend) = match &e {
        CoreError::NotFound => (StatusCode::NOT_FOUND, "not_found", None),
        CoreError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden", None),
        CoreError::InvalidState(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_state", None),
        CoreError::Conflict { backend } => (StatusCode::CONFLICT, "conflict", Some(*backend)),
        CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation", None),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            kind: kind.to_string(),
            backend,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut snap = st.status.read().await.clone();
    snap.daemon_uptime_secs = uptime_secs();
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// POST /v1/reservations
// ---------------------------------------------------------------------------

pub(crate) async fn reserve(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ReserveRequest>,
) -> Response {
    let buyer = Actor::user(req.buyer_id);
    match st.coordinator.reserve(req.listing_id, &buyer).await {
        Ok(tx) => {
            {
                let mut s = st.status.write().await;
                s.reservations += 1;
            }
            info!(listing_id = %req.listing_id, transaction_id = %tx.id, "reservation created");
            publish(&st, req.listing_id, tx.id, ListingStatus::Approved, ListingStatus::Reserved);
            (StatusCode::CREATED, Json(TransactionResponse { transaction: tx })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/reservations/{listing_id}/complete
// ---------------------------------------------------------------------------

pub(crate) async fn complete(
    State(st): State<Arc<AppState>>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<SettleRequest>,
) -> Response {
    let actor = actor_from(req.actor_id, req.is_admin);
    match st.coordinator.complete(listing_id, &actor).await {
        Ok(tx) => {
            {
                let mut s = st.status.write().await;
                s.completions += 1;
            }
            info!(%listing_id, transaction_id = %tx.id, "sale completed");
            publish(&st, listing_id, tx.id, ListingStatus::Reserved, ListingStatus::Sold);
            (StatusCode::OK, Json(TransactionResponse { transaction: tx })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/reservations/{listing_id}/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel(
    State(st): State<Arc<AppState>>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<SettleRequest>,
) -> Response {
    let actor = actor_from(req.actor_id, req.is_admin);
    match st.coordinator.cancel(listing_id, &actor).await {
        Ok(Some(tx)) => {
            {
                let mut s = st.status.write().await;
                s.cancellations += 1;
            }
            info!(%listing_id, transaction_id = %tx.id, "reservation cancelled");
            publish(&st, listing_id, tx.id, ListingStatus::Reserved, ListingStatus::Approved);
            (StatusCode::OK, Json(CancelResponse::default())).into_response()
        }
        // Duplicate retry: nothing to release, same success shape.
        Ok(None) => (StatusCode::OK, Json(CancelResponse::default())).into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/reservations/{listing_id}
// ---------------------------------------------------------------------------

pub(crate) async fn active_reservation(
    State(st): State<Arc<AppState>>,
    Path(listing_id): Path<ListingId>,
    Query(q): Query<ActorQuery>,
) -> Response {
    let actor = actor_from(q.actor_id, q.is_admin);
    match st.coordinator.active_reservation(listing_id, &actor).await {
        Ok(Some(tx)) => {
            (StatusCode::OK, Json(TransactionResponse { transaction: tx })).into_response()
        }
        Ok(None) => error_response(CoreError::NotFound),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/transactions/{transaction_id}
// ---------------------------------------------------------------------------

pub(crate) async fn transaction(
    State(st): State<Arc<AppState>>,
    Path(transaction_id): Path<TransactionId>,
    Query(q): Query<ActorQuery>,
) -> Response {
    let actor = actor_from(q.actor_id, q.is_admin);
    match st.coordinator.transaction(transaction_id, &actor).await {
        Ok(tx) => (StatusCode::OK, Json(TransactionResponse { transaction: tx })).into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Reservation(_) => "reservation",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Publish the status transition for external subscribers.
fn publish(
    st: &AppState,
    listing_id: ListingId,
    transaction_id: TransactionId,
    from_status: ListingStatus,
    to_status: ListingStatus,
) {
    let _ = st.bus.send(BusMsg::Reservation(DomainEvent {
        listing_id,
        transaction_id,
        from_status,
        to_status,
    }));
}
