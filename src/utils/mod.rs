//! Pure utility functions.
//!
//! These are stateless helpers shared by the bus and the binaries.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
