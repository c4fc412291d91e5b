//!
//! Quill Core - shared foundation for the Quill crates
//!
//! This crate defines the store-level error type and the time seams
//! (`Clock`, `Sleeper`) that the resilience components are built on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Error types
pub mod error;

/// Clock and sleep abstractions
pub mod time;

// Re-export key types
pub use error::CoreError;
pub use time::{Clock, ManualClock, ManualSleeper, Sleeper, SystemClock, TokioSleeper};
