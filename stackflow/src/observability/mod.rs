//! Observability utilities.

mod tracing;
mod wide_events;

pub use tracing::{init_tracing, LogFormat};
pub use wide_events::WideEventEmitter;
