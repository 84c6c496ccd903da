//! Process-wide tracing setup shared by every host of the reservation engine.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{init_with, LogFormat, LogFormatError, TracingConfig};

/// Initialize tracing from the environment.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    crate::tracing::init();
}
