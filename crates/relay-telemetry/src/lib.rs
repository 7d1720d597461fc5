//! Logging setup shared by the relay binaries and tests.
//!
//! Output is produced through the `tracing` ecosystem; the subscriber is
//! either human-readable or JSON depending on how the process is deployed.

pub mod logging;
