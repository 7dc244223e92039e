//! Core traits defining the interfaces between components.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CacheStats, Feature, FeatureId, IndexEntry, Origin, Term, TermBinding};

/// Durable keyed storage of features, unique on the origin pair.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Fetch a feature by id.
    async fn get_feature(&self, id: &FeatureId) -> Result<Feature>;

    /// Fetch the features that exist among `ids`, in request order.
    async fn get_features(&self, ids: &[FeatureId]) -> Result<Vec<Feature>>;

    /// Fetch the single feature for an origin pair.
    async fn find_by_origin(&self, origin: &Origin) -> Result<Feature>;

    /// Insert, or replace in place keeping the existing id.
    ///
    /// Returns the id the feature is stored under.
    async fn put_feature(&self, feature: Feature) -> Result<FeatureId>;

    /// Delete a feature and every index entry that references it.
    async fn delete_feature(&self, id: &FeatureId) -> Result<()>;
}

/// Inverted index from a term to the one feature that owns it.
#[async_trait]
pub trait TermIndex: Send + Sync {
    /// Look up a single term.
    async fn lookup_term(&self, term: &str) -> Result<TermBinding>;

    /// One page of entries with the given term type, ordered by term,
    /// starting strictly after `after`.
    async fn scan_term_type(
        &self,
        term_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>>;

    /// Bind a batch of terms to a feature, all or nothing.
    async fn index_terms(&self, feature_id: &FeatureId, terms: &[Term]) -> Result<()>;

    /// Drop every entry bound to a feature. Returns the number removed.
    async fn remove_all_for_feature(&self, feature_id: &FeatureId) -> Result<usize>;

    /// All entries bound to a feature, ordered by term.
    async fn terms_for_feature(&self, feature_id: &FeatureId) -> Result<Vec<IndexEntry>>;
}

/// Backend able to run the composite cache operations atomically.
///
/// Implementations must run each method as a single transaction so that no
/// reader observes a half-applied write.
#[async_trait]
pub trait CacheBackend: FeatureStore + TermIndex {
    /// Term lookup joined with its feature in one consistent read.
    ///
    /// A dangling entry is an integrity error, never a miss.
    async fn resolve_term(&self, term: &str) -> Result<Feature>;

    /// Put the feature, drop its stale terms, index the new set.
    async fn upsert(&self, feature: Feature, terms: &[Term]) -> Result<FeatureId>;

    /// Delete the feature for an origin pair, cascading its terms.
    async fn evict(&self, origin: &Origin) -> Result<FeatureId>;

    /// Remove every feature and index entry.
    async fn clear(&self) -> Result<()>;

    /// Counts for monitoring and the CLI.
    async fn stats(&self) -> Result<CacheStats>;
}
