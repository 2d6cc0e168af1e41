//! Ops endpoints exposing isolation snapshots

mod health;
mod metrics;
mod routes;

pub use routes::api_routes;
