//! # tributary-core
//!
//! Core types, traits, and abstractions for tributary.
//!
//! This crate provides the data model shared by every other crate (sources,
//! work items, stage flags, task envelopes, batch progress), the common
//! error type, default constants, structured logging field names, the
//! boundary traits the scheduling core is written against, and in-memory
//! implementations of those traits.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, FetchError, Result};
pub use models::*;
pub use traits::*;
