//! Cache facade over a storage backend.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use geocache_core::{
    BackendKind, CacheBackend, CacheConfig, CacheError, CacheStats, Feature, FeatureId,
    IndexEntry, OptionalExt, Origin, Result, Term, TermBinding,
};
use geocache_store::{MemoryStore, SqliteStore};

use crate::scan::TermScan;

/// The feature cache as seen by the normalization pipeline.
///
/// Every method maps to one atomic backend operation, so callers never see
/// the feature store and the term index disagree.
#[derive(Clone)]
pub struct GeoCache {
    /// Storage backend.
    backend: Arc<dyn CacheBackend>,

    /// Page size for term-type scans.
    page_size: usize,
}

impl GeoCache {
    /// Wrap an existing backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            page_size: CacheConfig::default().scan.page_size,
        }
    }

    /// Open the backend described by `config`.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            BackendKind::Sqlite => {
                Arc::new(SqliteStore::open(&config.database.path, &config.database)?)
            }
            BackendKind::Memory => {
                info!("Using in-memory feature cache");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self {
            backend,
            page_size: config.scan.page_size,
        })
    }

    /// Fresh in-memory cache.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Override the term scan page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Underlying backend, for direct feature store / term index access.
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Feature bound to `term`.
    ///
    /// A miss is `TermNotFound`. An index entry whose feature is gone is an
    /// integrity error and is never reported as a miss.
    pub async fn resolve(&self, term: &str) -> Result<Feature> {
        if term.is_empty() {
            return Err(CacheError::invalid_argument("term must not be empty"));
        }
        self.backend.resolve_term(term).await
    }

    /// Like `resolve`, but a miss is `Ok(None)`.
    pub async fn try_resolve(&self, term: &str) -> Result<Option<Feature>> {
        self.resolve(term).await.found()
    }

    /// Store a feature and make `terms` its exact term set.
    ///
    /// Returns the feature's id, which stays the same across re-upserts of
    /// the same origin pair. On any error nothing is written.
    pub async fn upsert(&self, feature: Feature, terms: &[Term]) -> Result<FeatureId> {
        let start = Instant::now();
        let origin = feature.origin.clone();

        let id = self.backend.upsert(feature, terms).await?;

        debug!(
            "Upserted {} as {} with {} terms in {:?}",
            origin,
            id,
            terms.len(),
            start.elapsed()
        );
        Ok(id)
    }

    /// Remove the feature for an origin pair together with all its terms.
    pub async fn evict(&self, origin: &Origin) -> Result<FeatureId> {
        let id = self.backend.evict(origin).await?;
        info!("Evicted {} ({})", id, origin);
        Ok(id)
    }

    pub async fn find_by_origin(&self, origin: &Origin) -> Result<Feature> {
        self.backend.find_by_origin(origin).await
    }

    pub async fn get(&self, id: &FeatureId) -> Result<Feature> {
        self.backend.get_feature(id).await
    }

    /// Features that exist among `ids`, in request order.
    pub async fn get_many(&self, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        self.backend.get_features(ids).await
    }

    /// Raw index binding for `term`.
    pub async fn lookup(&self, term: &str) -> Result<TermBinding> {
        self.backend.lookup_term(term).await
    }

    /// Lazy scan of every entry with `term_type`.
    pub fn lookup_by_type(&self, term_type: &str) -> TermScan {
        TermScan::new(self.backend.clone(), term_type.to_string(), self.page_size)
    }

    pub async fn terms_for_feature(&self, id: &FeatureId) -> Result<Vec<IndexEntry>> {
        self.backend.terms_for_feature(id).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }

    /// Remove every feature and term.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }
}
