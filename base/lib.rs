//! Shared, domain-agnostic plumbing used by every crate in the workspace:
//! error handling, clock abstraction, graceful shutdown, and small string
//! helpers.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
