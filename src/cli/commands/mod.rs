//! Command runners.

mod gateway;
mod pubsub;

pub use gateway::run_gateway;
pub use pubsub::{run_publish, run_subscribe};
