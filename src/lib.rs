// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Domain
pub mod isolation;

// Background work
pub mod tasks;

// Boundary adapters
pub mod api;
pub mod compat;
pub mod server;
