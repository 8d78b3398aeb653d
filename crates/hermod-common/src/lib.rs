//! Shared foundation for the hermod messaging fabric.
//!
//! Carries the umbrella error type that every hermod crate converges into
//! and the trace-context propagation helpers used across async boundaries.

pub mod error;
pub mod trace;

pub use error::{FabricError, Result};
pub use trace::{current_trace_id, ensure_trace_id, new_trace_id, with_trace_id};
