//! Structured JSONL tracing shared by the launcher and the install tools.

pub mod safe_print;
pub mod trace;

pub use trace::{Span, Tracer};
