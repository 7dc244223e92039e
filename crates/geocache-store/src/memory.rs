//! In-memory storage implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use geocache_core::{
    normalize_batch, CacheBackend, CacheError, CacheStats, Feature, FeatureId, FeatureStore,
    IndexEntry, Origin, Result, Term, TermBinding, TermIndex,
};

/// Stored binding for one term.
#[derive(Debug, Clone)]
struct Binding {
    term_type: String,
    feature_id: FeatureId,
}

/// Every map the store keeps, guarded together.
#[derive(Debug, Default)]
struct Tables {
    features: HashMap<FeatureId, Feature>,
    by_origin: HashMap<Origin, FeatureId>,
    /// Ordered so term-type scans can page by term.
    terms: BTreeMap<String, Binding>,
    /// Reverse map for O(terms-of-feature) cascade.
    terms_by_feature: HashMap<FeatureId, BTreeSet<String>>,
    terms_by_type: HashMap<String, BTreeSet<String>>,
}

impl Tables {
    fn missing_feature(id: &FeatureId) -> CacheError {
        CacheError::FeatureNotFound { id: id.to_string() }
    }

    /// Insert or replace in place. Returns the stored id and whether it existed.
    fn put(&mut self, feature: &Feature) -> Result<(FeatureId, bool)> {
        if let Some(existing) = self.by_origin.get(&feature.origin).cloned() {
            let mut replacement = feature.clone();
            replacement.id = existing.clone();
            self.features.insert(existing.clone(), replacement);
            debug!("Replaced feature {} ({})", existing, feature.origin);
            return Ok((existing, true));
        }

        if let Some(holder) = self.features.get(&feature.id) {
            warn!(
                "Feature id {} for {} already used by {}",
                feature.id, feature.origin, holder.origin
            );
            return Err(CacheError::FeatureConflict {
                id: feature.id.to_string(),
                existing_origin: holder.origin.to_string(),
            });
        }

        self.by_origin
            .insert(feature.origin.clone(), feature.id.clone());
        self.features.insert(feature.id.clone(), feature.clone());
        debug!("Inserted feature {} ({})", feature.id, feature.origin);
        Ok((feature.id.clone(), false))
    }

    /// First term in `terms` bound to a feature other than `feature_id`.
    fn first_conflict(&self, feature_id: &FeatureId, terms: &[Term]) -> Option<CacheError> {
        terms.iter().find_map(|t| match self.terms.get(&t.term) {
            Some(b) if &b.feature_id != feature_id => Some(CacheError::TermConflict {
                term: t.term.clone(),
                bound_to: b.feature_id.to_string(),
            }),
            _ => None,
        })
    }

    /// Bind terms. Callers check `first_conflict` beforehand so this cannot fail halfway.
    ///
    /// A term already bound to `feature_id` keeps its stored term type.
    fn bind(&mut self, feature_id: &FeatureId, terms: &[Term]) {
        for t in terms {
            if self.terms.contains_key(&t.term) {
                continue;
            }
            self.terms.insert(
                t.term.clone(),
                Binding {
                    term_type: t.term_type.clone(),
                    feature_id: feature_id.clone(),
                },
            );
            self.terms_by_type
                .entry(t.term_type.clone())
                .or_default()
                .insert(t.term.clone());
            self.terms_by_feature
                .entry(feature_id.clone())
                .or_default()
                .insert(t.term.clone());
        }
        debug!("Indexed {} terms for feature {}", terms.len(), feature_id);
    }

    fn unbind(&mut self, term: &str) -> bool {
        let Some(binding) = self.terms.remove(term) else {
            return false;
        };
        if let Some(set) = self.terms_by_type.get_mut(&binding.term_type) {
            set.remove(term);
            if set.is_empty() {
                self.terms_by_type.remove(&binding.term_type);
            }
        }
        if let Some(set) = self.terms_by_feature.get_mut(&binding.feature_id) {
            set.remove(term);
            if set.is_empty() {
                self.terms_by_feature.remove(&binding.feature_id);
            }
        }
        true
    }

    fn unbind_all(&mut self, feature_id: &FeatureId) -> usize {
        let terms = self.terms_by_feature.remove(feature_id).unwrap_or_default();
        let mut removed = 0;
        for term in &terms {
            if self.unbind(term) {
                removed += 1;
            }
        }
        removed
    }

    fn unbind_stale(&mut self, feature_id: &FeatureId, keep: &[Term]) -> usize {
        let stale: Vec<String> = match self.terms_by_feature.get(feature_id) {
            Some(set) => set
                .iter()
                .filter(|term| !keep.iter().any(|t| &t.term == *term))
                .cloned()
                .collect(),
            None => return 0,
        };
        for term in &stale {
            self.unbind(term);
        }
        if !stale.is_empty() {
            debug!("Dropped {} stale terms for feature {}", stale.len(), feature_id);
        }
        stale.len()
    }

    fn delete(&mut self, id: &FeatureId) -> Result<usize> {
        let feature = self
            .features
            .remove(id)
            .ok_or_else(|| Self::missing_feature(id))?;
        self.by_origin.remove(&feature.origin);
        let terms = self.unbind_all(id);
        debug!("Deleted feature {} and {} terms", id, terms);
        Ok(terms)
    }

    fn entries_for(&self, feature_id: &FeatureId) -> Vec<IndexEntry> {
        self.terms_by_feature
            .get(feature_id)
            .into_iter()
            .flatten()
            .filter_map(|term| {
                self.terms.get(term).map(|b| IndexEntry {
                    term: term.clone(),
                    term_type: b.term_type.clone(),
                    feature_id: b.feature_id.clone(),
                })
            })
            .collect()
    }
}

/// Process-local store keeping features and the term index in maps.
///
/// A single `RwLock` covers all maps: reads share the lock, and every write
/// (including each composite operation) holds it exclusively, so readers
/// only ever see whole operations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| CacheError::storage(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| CacheError::storage(format!("Lock poisoned: {}", e)))
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn get_feature(&self, id: &FeatureId) -> Result<Feature> {
        self.read()?
            .features
            .get(id)
            .cloned()
            .ok_or_else(|| Tables::missing_feature(id))
    }

    async fn get_features(&self, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        let tables = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| tables.features.get(id).cloned())
            .collect())
    }

    async fn find_by_origin(&self, origin: &Origin) -> Result<Feature> {
        let tables = self.read()?;
        tables
            .by_origin
            .get(origin)
            .and_then(|id| tables.features.get(id))
            .cloned()
            .ok_or_else(|| CacheError::OriginNotFound {
                origin_id: origin.id,
                origin_type: origin.kind.clone(),
            })
    }

    async fn put_feature(&self, feature: Feature) -> Result<FeatureId> {
        self.write()?.put(&feature).map(|(id, _)| id)
    }

    async fn delete_feature(&self, id: &FeatureId) -> Result<()> {
        self.write()?.delete(id).map(|_| ())
    }
}

#[async_trait]
impl TermIndex for MemoryStore {
    async fn lookup_term(&self, term: &str) -> Result<TermBinding> {
        self.read()?
            .terms
            .get(term)
            .map(|b| TermBinding {
                feature_id: b.feature_id.clone(),
                term_type: b.term_type.clone(),
            })
            .ok_or_else(|| CacheError::TermNotFound {
                term: term.to_string(),
            })
    }

    async fn scan_term_type(
        &self,
        term_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        let tables = self.read()?;
        let Some(set) = tables.terms_by_type.get(term_type) else {
            return Ok(Vec::new());
        };

        let page = set
            .iter()
            .filter(|term| after.map_or(true, |a| term.as_str() > a))
            .take(limit)
            .filter_map(|term| {
                tables.terms.get(term).map(|b| IndexEntry {
                    term: term.clone(),
                    term_type: b.term_type.clone(),
                    feature_id: b.feature_id.clone(),
                })
            })
            .collect();
        Ok(page)
    }

    async fn index_terms(&self, feature_id: &FeatureId, terms: &[Term]) -> Result<()> {
        let terms = normalize_batch(terms)?;
        let mut tables = self.write()?;
        if !tables.features.contains_key(feature_id) {
            return Err(Tables::missing_feature(feature_id));
        }
        if let Some(conflict) = tables.first_conflict(feature_id, &terms) {
            warn!("Rejecting term batch for {}: {}", feature_id, conflict);
            return Err(conflict);
        }
        tables.bind(feature_id, &terms);
        Ok(())
    }

    async fn remove_all_for_feature(&self, feature_id: &FeatureId) -> Result<usize> {
        let removed = self.write()?.unbind_all(feature_id);
        debug!("Removed {} terms for feature {}", removed, feature_id);
        Ok(removed)
    }

    async fn terms_for_feature(&self, feature_id: &FeatureId) -> Result<Vec<IndexEntry>> {
        Ok(self.read()?.entries_for(feature_id))
    }
}

#[async_trait]
impl CacheBackend for MemoryStore {
    async fn resolve_term(&self, term: &str) -> Result<Feature> {
        let tables = self.read()?;
        let binding = tables
            .terms
            .get(term)
            .ok_or_else(|| CacheError::TermNotFound {
                term: term.to_string(),
            })?;

        match tables.features.get(&binding.feature_id) {
            Some(feature) => Ok(feature.clone()),
            None => {
                error!(
                    "Term {:?} references missing feature {}",
                    term, binding.feature_id
                );
                Err(CacheError::integrity(format!(
                    "term {:?} references missing feature {}",
                    term, binding.feature_id
                )))
            }
        }
    }

    async fn upsert(&self, feature: Feature, terms: &[Term]) -> Result<FeatureId> {
        let terms = normalize_batch(terms)?;
        let mut tables = self.write()?;

        // Every check happens before the first mutation, so a failure
        // leaves the maps untouched.
        let target = tables
            .by_origin
            .get(&feature.origin)
            .cloned()
            .unwrap_or_else(|| feature.id.clone());
        if let Some(conflict) = tables.first_conflict(&target, &terms) {
            warn!("Rejecting upsert of {}: {}", feature.origin, conflict);
            return Err(conflict);
        }

        let (id, existed) = tables.put(&feature)?;
        if existed {
            tables.unbind_stale(&id, &terms);
        }
        tables.bind(&id, &terms);
        Ok(id)
    }

    async fn evict(&self, origin: &Origin) -> Result<FeatureId> {
        let mut tables = self.write()?;
        let id = tables
            .by_origin
            .get(origin)
            .cloned()
            .ok_or_else(|| CacheError::OriginNotFound {
                origin_id: origin.id,
                origin_type: origin.kind.clone(),
            })?;
        tables.delete(&id)?;
        Ok(id)
    }

    async fn clear(&self) -> Result<()> {
        let mut tables = self.write()?;
        let features = tables.features.len();
        let terms = tables.terms.len();
        *tables = Tables::default();
        info!("Cleared feature cache: {} features, {} terms", features, terms);
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let tables = self.read()?;
        Ok(CacheStats {
            features: tables.features.len() as u64,
            terms: tables.terms.len() as u64,
            terms_by_type: tables
                .terms_by_type
                .iter()
                .map(|(ty, set)| (ty.clone(), set.len() as u64))
                .collect(),
            storage_bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocache_core::term_types;

    #[tokio::test]
    async fn test_put_and_find() {
        let store = MemoryStore::new();
        let feature = Feature::new(Origin::relation(175905)).with_name("New York");
        let id = store.put_feature(feature.clone()).await.unwrap();
        assert_eq!(id.as_str(), "R175905");
        assert_eq!(
            store.find_by_origin(&Origin::relation(175905)).await.unwrap(),
            feature
        );
    }

    #[tokio::test]
    async fn test_replace_keeps_id() {
        let store = MemoryStore::new();
        let custom = FeatureId::new("ny").unwrap();
        store
            .put_feature(Feature::new(Origin::relation(1)).with_id(custom.clone()))
            .await
            .unwrap();

        let id = store
            .put_feature(Feature::new(Origin::relation(1)).with_place_rank(8))
            .await
            .unwrap();
        assert_eq!(id, custom);
        assert_eq!(store.get_feature(&custom).await.unwrap().place_rank, Some(8));
        assert!(store
            .get_feature(&FeatureId::new("R1").unwrap())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_rebinding_same_feature_keeps_term_type() {
        let store = MemoryStore::new();
        let id = store.put_feature(Feature::new(Origin::node(1))).await.unwrap();
        store
            .index_terms(&id, &[Term::new("paris", term_types::NAME)])
            .await
            .unwrap();
        store
            .index_terms(&id, &[Term::new("paris", term_types::QUERY)])
            .await
            .unwrap();

        assert_eq!(
            store.lookup_term("paris").await.unwrap().term_type,
            term_types::NAME
        );
        assert_eq!(
            store
                .scan_term_type(term_types::NAME, None, 10)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .scan_term_type(term_types::QUERY, None, 10)
            .await
            .unwrap()
            .is_empty());

        // Re-upserting with a new type for the same term is no different.
        store
            .upsert(
                Feature::new(Origin::node(1)),
                &[Term::new("paris", term_types::QUERY)],
            )
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.terms_by_type.len(), 1);
        assert_eq!(stats.terms_by_type.get(term_types::NAME), Some(&1));
    }

    #[tokio::test]
    async fn test_unbinding_last_term_of_type_drops_it_from_stats() {
        let store = MemoryStore::new();
        store
            .upsert(
                Feature::new(Origin::node(1)),
                &[Term::new("paris", term_types::NAME)],
            )
            .await
            .unwrap();
        store
            .upsert(
                Feature::new(Origin::node(1)),
                &[Term::new("paris, fr", term_types::QUERY)],
            )
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.terms, 1);
        assert_eq!(stats.terms_by_type.len(), 1);
        assert_eq!(stats.terms_by_type.get(term_types::QUERY), Some(&1));
    }

    #[tokio::test]
    async fn test_upsert_conflict_leaves_maps_untouched() {
        let store = MemoryStore::new();
        store
            .upsert(
                Feature::new(Origin::way(1)),
                &[Term::new("main st", term_types::ADDRESS)],
            )
            .await
            .unwrap();
        store
            .upsert(
                Feature::new(Origin::way(2)),
                &[Term::new("elm st", term_types::ADDRESS)],
            )
            .await
            .unwrap();

        // Re-upsert of way/2 steals "main st": rejected, "elm st" survives.
        let err = store
            .upsert(
                Feature::new(Origin::way(2)).with_name("changed"),
                &[Term::new("main st", term_types::ADDRESS)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TermConflict { .. }));

        let way2 = store.find_by_origin(&Origin::way(2)).await.unwrap();
        assert_eq!(way2.name, None);
        assert_eq!(store.lookup_term("elm st").await.unwrap().feature_id, way2.id);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = MemoryStore::new();
        let id = store
            .upsert(
                Feature::new(Origin::way(123)),
                &[
                    Term::new("central park", term_types::NAME),
                    Term::new("10024", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();

        store.delete_feature(&id).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.features, 0);
        assert_eq!(stats.terms, 0);
        assert!(stats.terms_by_type.is_empty());
        assert!(store.find_by_origin(&Origin::way(123)).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_detects_dangling_entry() {
        let store = MemoryStore::new();
        store
            .upsert(
                Feature::new(Origin::way(1)),
                &[Term::new("ghost", term_types::NAME)],
            )
            .await
            .unwrap();

        // Simulate corruption by removing the feature only.
        store
            .write()
            .unwrap()
            .features
            .remove(&FeatureId::new("W1").unwrap());

        let err = store.resolve_term("ghost").await.unwrap_err();
        assert!(matches!(err, CacheError::Integrity { .. }));
    }
}
