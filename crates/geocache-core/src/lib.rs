//! geocache-core - Core types and traits for the geocoding feature cache
//!
//! This crate provides the domain types (features, origin pairs, terms),
//! the storage traits and the error type shared by every backend and the
//! cache facade.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{CacheError, ErrorKind, OptionalExt, Result};
pub use traits::*;
pub use types::*;
