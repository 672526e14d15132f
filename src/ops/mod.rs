//! Operations.
//!
//! - `telemetry` - tracing initialization and the admin HTTP console

pub mod telemetry;

pub use telemetry::{init_tracing, start_console, LogHandle, StatusSource};
