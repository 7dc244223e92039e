//! geocache-engine - Cache facade for the geocoding pipeline
//!
//! This crate binds the feature store and the term index into the handful
//! of operations the normalization pipeline uses. Each one runs as a single
//! backend transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use geocache_engine::GeoCache;
//! use geocache_core::{Feature, Origin, Term};
//!
//! let cache = GeoCache::open(&CacheConfig::load_default()?)?;
//! if cache.try_resolve("central park").await?.is_none() {
//!     let feature = Feature::new(Origin::way(123)).with_name("Central Park");
//!     cache.upsert(feature, &[Term::new("central park", "query")]).await?;
//! }
//! ```

mod engine;
mod scan;

pub use engine::GeoCache;
pub use scan::TermScan;

// Re-export for convenience
pub use geocache_core::{CacheError, Feature, FeatureId, Origin, Term};
