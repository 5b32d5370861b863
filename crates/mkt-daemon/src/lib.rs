//! mkt-daemon library surface.
//!
//! Exposes the router, state, and API types so the scenario tests can drive
//! the HTTP surface in-process without binding a socket.

pub mod api_types;
pub mod routes;
pub mod state;
