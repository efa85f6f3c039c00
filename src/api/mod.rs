//! HTTP surface
//!
//! REST over JSON for AMR task submission, cached AMR state, lifter task
//! management and readiness. The mission/event traffic does not pass
//! through here; it lives on the typed event bus.

pub mod models;
pub mod rest;

pub use rest::{ApiContext, RestApiServer};
