//! SQLite-based storage implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, error, info, warn};

use geocache_core::{
    normalize_batch, CacheBackend, CacheError, CacheStats, DatabaseConfig, Feature, FeatureId,
    FeatureStore, IndexEntry, Origin, Result, Term, TermBinding, TermIndex,
};

use crate::schema::{SCHEMA, TABLES};

const FEATURE_COLUMNS: &str = "id, osm_id, osm_type, name, address, place_rank, \
                               latitude, longitude, bounding_box, polygon";

/// SQLite-based store implementation.
///
/// All writes go through a single connection behind a blocking Mutex, so
/// writers are serialized and each composite operation is one IMMEDIATE
/// transaction. File databases also get a pool of read-only connections;
/// with WAL enabled, readers never wait on each other or on the writer.
pub struct SqliteStore {
    /// Write connection.
    writer: Arc<Mutex<Connection>>,

    /// Read-only connections (empty for in-memory databases).
    readers: Arc<Vec<Mutex<Connection>>>,

    /// Round-robin cursor into `readers`.
    next_reader: AtomicUsize,

    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| CacheError::storage(format!("Failed to open database: {}", e)))?;

        Self::configure_writer(&writer, config)?;
        Self::init_schema(&writer, path)?;

        let mut readers = Vec::with_capacity(config.read_connections);
        for _ in 0..config.read_connections {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| CacheError::storage(format!("Failed to open read connection: {}", e)))?;
            Self::configure_reader(&reader, config)?;
            readers.push(Mutex::new(reader));
        }

        info!(
            "Feature cache opened at {:?} ({} read connections)",
            path,
            readers.len()
        );

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: AtomicUsize::new(0),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database (for testing).
    ///
    /// Reads share the single connection with writes.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CacheError::storage(format!("Failed to open in-memory database: {}", e))
        })?;

        let config = DatabaseConfig {
            wal_mode: false,
            ..DatabaseConfig::default()
        };
        Self::configure_writer(&conn, &config)?;
        Self::init_schema(&conn, Path::new(":memory:"))?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: AtomicUsize::new(0),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Remove a database file and its WAL side files.
    ///
    /// Returns false if there was nothing to delete.
    pub fn delete_database(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let mut side = path.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if side.exists() {
                std::fs::remove_file(side)?;
            }
        }
        info!("Deleted feature cache database {:?}", path);
        Ok(true)
    }

    /// Location of the database (":memory:" for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn configure_writer(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
        let journal = if config.wal_mode { "WAL" } else { "DELETE" };
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = {journal};
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = {cache};
            PRAGMA busy_timeout = {timeout};
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
            journal = journal,
            cache = config.cache_size,
            timeout = config.busy_timeout_ms,
        ))
        .map_err(|e| CacheError::storage(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    fn configure_reader(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA cache_size = {cache};
            PRAGMA busy_timeout = {timeout};
            PRAGMA foreign_keys = ON;
            "#,
            cache = config.cache_size,
            timeout = config.busy_timeout_ms,
        ))
        .map_err(|e| CacheError::storage(format!("Failed to configure read connection: {}", e)))?;

        Ok(())
    }

    /// Create the schema on an empty database, or check an existing one.
    fn init_schema(conn: &Connection, path: &Path) -> Result<()> {
        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(storage_err)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(storage_err)?;
            rows
        };

        if tables.is_empty() {
            conn.execute_batch(SCHEMA)
                .map_err(|e| CacheError::storage(format!("Failed to initialize schema: {}", e)))?;
            debug!("Initialized feature cache schema at {:?}", path);
            return Ok(());
        }

        for table in TABLES {
            if !tables.iter().any(|t| t == table) {
                return Err(CacheError::storage(format!(
                    "Database at {:?} is not a feature cache (missing table {})",
                    path, table
                )));
            }
        }
        Ok(())
    }

    /// Execute a read on a pooled connection.
    fn with_reader<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        if self.readers.is_empty() {
            let conn = self.writer.lock().map_err(|e| CacheError::storage(e.to_string()))?;
            return f(&conn);
        }

        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        for offset in 0..self.readers.len() {
            let slot = &self.readers[(start + offset) % self.readers.len()];
            if let Ok(conn) = slot.try_lock() {
                return f(&conn);
            }
        }

        let conn = self.readers[start]
            .lock()
            .map_err(|e| CacheError::storage(e.to_string()))?;
        f(&conn)
    }

    /// Execute a write on the single writer connection.
    fn with_writer<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut conn = self.writer.lock().map_err(|e| CacheError::storage(e.to_string()))?;
        f(&mut conn)
    }

    /// Run `f` inside an IMMEDIATE transaction; rolls back on error.
    fn write_tx<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        self.with_writer(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(storage_err)?;
            let out = f(&tx)?;
            tx.commit().map_err(storage_err)?;
            Ok(out)
        })
    }
}

#[async_trait]
impl FeatureStore for SqliteStore {
    async fn get_feature(&self, id: &FeatureId) -> Result<Feature> {
        self.with_reader(|conn| {
            select_feature(conn, id)?.ok_or_else(|| CacheError::FeatureNotFound {
                id: id.to_string(),
            })
        })
    }

    async fn get_features(&self, ids: &[FeatureId]) -> Result<Vec<Feature>> {
        self.with_reader(|conn| {
            // One read transaction so the batch sees a single snapshot.
            let tx = conn.unchecked_transaction().map_err(storage_err)?;
            let mut features = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(feature) = select_feature(&tx, id)? {
                    features.push(feature);
                }
            }
            tx.finish().map_err(storage_err)?;
            Ok(features)
        })
    }

    async fn find_by_origin(&self, origin: &Origin) -> Result<Feature> {
        self.with_reader(|conn| {
            select_by_origin(conn, origin)?.ok_or_else(|| CacheError::OriginNotFound {
                origin_id: origin.id,
                origin_type: origin.kind.clone(),
            })
        })
    }

    async fn put_feature(&self, feature: Feature) -> Result<FeatureId> {
        self.write_tx(|tx| write_feature(tx, &feature).map(|(id, _)| id))
    }

    async fn delete_feature(&self, id: &FeatureId) -> Result<()> {
        self.write_tx(|tx| delete_cascade(tx, id).map(|_| ()))
    }
}

#[async_trait]
impl TermIndex for SqliteStore {
    async fn lookup_term(&self, term: &str) -> Result<TermBinding> {
        self.with_reader(|conn| {
            conn.query_row(
                "SELECT feature_id, term_type FROM feature_index WHERE term = ?1",
                params![term],
                |row| {
                    Ok(TermBinding {
                        feature_id: feature_id_at(row, 0)?,
                        term_type: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| CacheError::TermNotFound {
                term: term.to_string(),
            })
        })
    }

    async fn scan_term_type(
        &self,
        term_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>> {
        self.with_reader(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT term, term_type, feature_id
                    FROM feature_index
                    WHERE term_type = ?1
                    AND (?2 IS NULL OR term > ?2)
                    ORDER BY term
                    LIMIT ?3
                    "#,
                )
                .map_err(storage_err)?;

            let entries = stmt
                .query_map(params![term_type, after, limit as i64], row_to_entry)
                .map_err(storage_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(storage_err)?;

            Ok(entries)
        })
    }

    async fn index_terms(&self, feature_id: &FeatureId, terms: &[Term]) -> Result<()> {
        let terms = normalize_batch(terms)?;
        self.write_tx(|tx| {
            if select_feature(tx, feature_id)?.is_none() {
                return Err(CacheError::FeatureNotFound {
                    id: feature_id.to_string(),
                });
            }
            bind_terms(tx, feature_id, &terms)
        })
    }

    async fn remove_all_for_feature(&self, feature_id: &FeatureId) -> Result<usize> {
        self.write_tx(|tx| {
            let removed = tx
                .execute(
                    "DELETE FROM feature_index WHERE feature_id = ?1",
                    params![feature_id.as_str()],
                )
                .map_err(storage_err)?;
            debug!("Removed {} terms for feature {}", removed, feature_id);
            Ok(removed)
        })
    }

    async fn terms_for_feature(&self, feature_id: &FeatureId) -> Result<Vec<IndexEntry>> {
        self.with_reader(|conn| select_terms_for(conn, feature_id))
    }
}

#[async_trait]
impl CacheBackend for SqliteStore {
    async fn resolve_term(&self, term: &str) -> Result<Feature> {
        self.with_reader(|conn| {
            let sql = format!(
                r#"
                SELECT fi.feature_id, {cols}
                FROM feature_index fi
                LEFT JOIN feature f ON f.id = fi.feature_id
                WHERE fi.term = ?1
                "#,
                cols = prefixed_columns("f"),
            );

            let row: Option<(String, Option<Feature>)> = conn
                .query_row(&sql, params![term], |row| {
                    let bound: String = row.get(0)?;
                    let present: Option<String> = row.get(1)?;
                    let feature = match present {
                        Some(_) => Some(row_to_feature(row, 1)?),
                        None => None,
                    };
                    Ok((bound, feature))
                })
                .optional()
                .map_err(storage_err)?;

            match row {
                None => Err(CacheError::TermNotFound {
                    term: term.to_string(),
                }),
                Some((_, Some(feature))) => Ok(feature),
                Some((bound, None)) => {
                    error!(
                        "Term {:?} references missing feature {} in {:?}",
                        term, bound, self.path
                    );
                    Err(CacheError::integrity(format!(
                        "term {:?} references missing feature {}",
                        term, bound
                    )))
                }
            }
        })
    }

    async fn upsert(&self, feature: Feature, terms: &[Term]) -> Result<FeatureId> {
        let terms = normalize_batch(terms)?;
        self.write_tx(|tx| {
            let (id, existed) = write_feature(tx, &feature)?;
            if existed {
                unbind_stale(tx, &id, &terms)?;
            }
            bind_terms(tx, &id, &terms)?;
            Ok(id)
        })
    }

    async fn evict(&self, origin: &Origin) -> Result<FeatureId> {
        self.write_tx(|tx| {
            let feature = select_by_origin(tx, origin)?.ok_or_else(|| {
                CacheError::OriginNotFound {
                    origin_id: origin.id,
                    origin_type: origin.kind.clone(),
                }
            })?;
            delete_cascade(tx, &feature.id)?;
            Ok(feature.id)
        })
    }

    async fn clear(&self) -> Result<()> {
        self.write_tx(|tx| {
            let terms = tx
                .execute("DELETE FROM feature_index", [])
                .map_err(storage_err)?;
            let features = tx.execute("DELETE FROM feature", []).map_err(storage_err)?;
            info!("Cleared feature cache: {} features, {} terms", features, terms);
            Ok(())
        })
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.with_reader(|conn| {
            let tx = conn.unchecked_transaction().map_err(storage_err)?;

            let features: u64 = tx
                .query_row("SELECT COUNT(*) FROM feature", [], |row| row.get(0))
                .map_err(storage_err)?;
            let terms: u64 = tx
                .query_row("SELECT COUNT(*) FROM feature_index", [], |row| row.get(0))
                .map_err(storage_err)?;

            let terms_by_type = {
                let mut stmt = tx
                    .prepare(
                        "SELECT COALESCE(term_type, ''), COUNT(*) FROM feature_index GROUP BY term_type",
                    )
                    .map_err(storage_err)?;
                let rows: BTreeMap<String, u64> = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))
                    .map_err(storage_err)?
                    .collect::<std::result::Result<_, _>>()
                    .map_err(storage_err)?;
                rows
            };

            // Get page count and page size to estimate storage
            let page_count: u64 = tx
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .map_err(storage_err)?;
            let page_size: u64 = tx
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(storage_err)?;

            tx.finish().map_err(storage_err)?;

            Ok(CacheStats {
                features,
                terms,
                terms_by_type,
                storage_bytes: page_count * page_size,
            })
        })
    }
}

// Statement helpers, shared by single and composite operations.

fn storage_err(e: rusqlite::Error) -> CacheError {
    CacheError::storage(e.to_string())
}

fn prefixed_columns(alias: &str) -> String {
    FEATURE_COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_feature(conn: &Connection, id: &FeatureId) -> Result<Option<Feature>> {
    conn.query_row(
        &format!("SELECT {} FROM feature WHERE id = ?1", FEATURE_COLUMNS),
        params![id.as_str()],
        |row| row_to_feature(row, 0),
    )
    .optional()
    .map_err(storage_err)
}

fn select_by_origin(conn: &Connection, origin: &Origin) -> Result<Option<Feature>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM feature WHERE osm_id = ?1 AND osm_type = ?2",
            FEATURE_COLUMNS
        ),
        params![origin.id, origin.kind],
        |row| row_to_feature(row, 0),
    )
    .optional()
    .map_err(storage_err)
}

fn select_terms_for(conn: &Connection, feature_id: &FeatureId) -> Result<Vec<IndexEntry>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT term, term_type, feature_id
            FROM feature_index
            WHERE feature_id = ?1
            ORDER BY term
            "#,
        )
        .map_err(storage_err)?;

    let entries = stmt
        .query_map(params![feature_id.as_str()], row_to_entry)
        .map_err(storage_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(storage_err)?;

    Ok(entries)
}

/// Insert the feature, or overwrite the row already holding its origin pair.
///
/// Returns the stored id and whether the origin pair already existed.
fn write_feature(conn: &Connection, feature: &Feature) -> Result<(FeatureId, bool)> {
    if let Some(existing) = select_by_origin(conn, &feature.origin)? {
        conn.execute(
            r#"
            UPDATE feature
            SET name = ?2, address = ?3, place_rank = ?4, latitude = ?5,
                longitude = ?6, bounding_box = ?7, polygon = ?8
            WHERE id = ?1
            "#,
            params![
                existing.id.as_str(),
                feature.name,
                feature.address,
                feature.place_rank,
                feature.latitude,
                feature.longitude,
                feature.bounding_box,
                feature.polygon,
            ],
        )
        .map_err(|e| CacheError::storage(format!("Failed to update feature: {}", e)))?;

        debug!("Replaced feature {} ({})", existing.id, feature.origin);
        return Ok((existing.id, true));
    }

    let holder: Option<(i64, String)> = conn
        .query_row(
            "SELECT osm_id, osm_type FROM feature WHERE id = ?1",
            params![feature.id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(storage_err)?;

    if let Some((osm_id, osm_type)) = holder {
        warn!(
            "Feature id {} for {} already used by {}/{}",
            feature.id, feature.origin, osm_type, osm_id
        );
        return Err(CacheError::FeatureConflict {
            id: feature.id.to_string(),
            existing_origin: Origin::new(osm_id, osm_type).to_string(),
        });
    }

    conn.execute(
        &format!(
            "INSERT INTO feature ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            FEATURE_COLUMNS
        ),
        params![
            feature.id.as_str(),
            feature.origin.id,
            feature.origin.kind,
            feature.name,
            feature.address,
            feature.place_rank,
            feature.latitude,
            feature.longitude,
            feature.bounding_box,
            feature.polygon,
        ],
    )
    .map_err(|e| CacheError::storage(format!("Failed to insert feature: {}", e)))?;

    debug!("Inserted feature {} ({})", feature.id, feature.origin);
    Ok((feature.id.clone(), false))
}

/// Bind terms to an existing feature. The caller owns the transaction.
fn bind_terms(conn: &Connection, feature_id: &FeatureId, terms: &[Term]) -> Result<()> {
    let mut lookup = conn
        .prepare_cached("SELECT feature_id FROM feature_index WHERE term = ?1")
        .map_err(storage_err)?;

    for term in terms {
        let bound: Option<String> = lookup
            .query_row(params![term.term], |row| row.get(0))
            .optional()
            .map_err(storage_err)?;

        match bound {
            Some(owner) if owner != feature_id.as_str() => {
                warn!(
                    "Term {:?} already bound to {}, rejecting binding to {}",
                    term.term, owner, feature_id
                );
                return Err(CacheError::TermConflict {
                    term: term.term.clone(),
                    bound_to: owner,
                });
            }
            // Already bound here; the stored term type is kept.
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO feature_index (term, term_type, feature_id) VALUES (?1, ?2, ?3)",
                    params![term.term, term.term_type, feature_id.as_str()],
                )
                .map_err(|e| CacheError::storage(format!("Failed to index term: {}", e)))?;
            }
        }
    }

    debug!("Indexed {} terms for feature {}", terms.len(), feature_id);
    Ok(())
}

/// Remove the feature's entries whose term is not in `keep`.
fn unbind_stale(conn: &Connection, feature_id: &FeatureId, keep: &[Term]) -> Result<usize> {
    let mut removed = 0;
    for entry in select_terms_for(conn, feature_id)? {
        if keep.iter().any(|t| t.term == entry.term) {
            continue;
        }
        removed += conn
            .execute(
                "DELETE FROM feature_index WHERE term = ?1",
                params![entry.term],
            )
            .map_err(storage_err)?;
    }
    if removed > 0 {
        debug!("Dropped {} stale terms for feature {}", removed, feature_id);
    }
    Ok(removed)
}

/// Delete a feature and its index entries. Returns the number of terms removed.
fn delete_cascade(conn: &Connection, id: &FeatureId) -> Result<usize> {
    // The foreign key cascades too; deleting explicitly keeps the count
    // and does not depend on the pragma being set.
    let terms = conn
        .execute(
            "DELETE FROM feature_index WHERE feature_id = ?1",
            params![id.as_str()],
        )
        .map_err(storage_err)?;

    let deleted = conn
        .execute("DELETE FROM feature WHERE id = ?1", params![id.as_str()])
        .map_err(storage_err)?;

    if deleted == 0 {
        return Err(CacheError::FeatureNotFound { id: id.to_string() });
    }

    debug!("Deleted feature {} and {} terms", id, terms);
    Ok(terms)
}

fn feature_id_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<FeatureId> {
    let raw: String = row.get(idx)?;
    FeatureId::new(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Convert a row to a Feature, reading `FEATURE_COLUMNS` from `offset`.
fn row_to_feature(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Feature> {
    Ok(Feature {
        id: feature_id_at(row, offset)?,
        origin: Origin::new(row.get(offset + 1)?, row.get::<_, String>(offset + 2)?),
        name: row.get(offset + 3)?,
        address: row.get(offset + 4)?,
        place_rank: row.get(offset + 5)?,
        latitude: row.get(offset + 6)?,
        longitude: row.get(offset + 7)?,
        bounding_box: row.get(offset + 8)?,
        polygon: row.get(offset + 9)?,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexEntry> {
    Ok(IndexEntry {
        term: row.get(0)?,
        term_type: row.get(1)?,
        feature_id: feature_id_at(row, 2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocache_core::{term_types, ErrorKind};

    fn central_park() -> Feature {
        Feature::new(Origin::way(123))
            .with_name("Central Park")
            .with_place_rank(22)
            .with_centroid(40.7826, -73.9656)
            .with_bounding_box("[40.76, 40.80, -73.98, -73.94]")
    }

    #[tokio::test]
    async fn test_open_memory() {
        let store = SqliteStore::open_memory().unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.features, 0);
        assert_eq!(stats.terms, 0);
    }

    #[tokio::test]
    async fn test_feature_crud() {
        let store = SqliteStore::open_memory().unwrap();

        let id = store.put_feature(central_park()).await.unwrap();
        assert_eq!(id.as_str(), "W123");

        let fetched = store.get_feature(&id).await.unwrap();
        assert_eq!(fetched, central_park());

        let by_origin = store.find_by_origin(&Origin::way(123)).await.unwrap();
        assert_eq!(by_origin.id, id);

        store.delete_feature(&id).await.unwrap();
        let err = store.get_feature(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = store.delete_feature(&id).await.unwrap_err();
        assert!(matches!(err, CacheError::FeatureNotFound { .. }));
    }

    #[tokio::test]
    async fn test_put_replaces_in_place() {
        let store = SqliteStore::open_memory().unwrap();

        let custom = FeatureId::new("park-1").unwrap();
        let first = store
            .put_feature(central_park().with_id(custom.clone()))
            .await
            .unwrap();
        assert_eq!(first, custom);
        store
            .index_terms(&first, &[Term::new("central park", term_types::NAME)])
            .await
            .unwrap();

        // Same origin, different id and data: row keeps its original id.
        let second = store
            .put_feature(central_park().with_name("Central Park, Manhattan"))
            .await
            .unwrap();
        assert_eq!(second, custom);

        let stored = store.get_feature(&custom).await.unwrap();
        assert_eq!(stored.name.as_deref(), Some("Central Park, Manhattan"));
        assert_eq!(store.lookup_term("central park").await.unwrap().feature_id, custom);
    }

    #[tokio::test]
    async fn test_put_explicit_id_conflict() {
        let store = SqliteStore::open_memory().unwrap();
        store.put_feature(central_park()).await.unwrap();

        let squatter = Feature::new(Origin::node(5)).with_id(FeatureId::new("W123").unwrap());
        let err = store.put_feature(squatter).await.unwrap_err();
        assert!(matches!(err, CacheError::FeatureConflict { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(store.find_by_origin(&Origin::node(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_get_features_skips_missing() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.put_feature(Feature::new(Origin::node(1))).await.unwrap();
        let b = store.put_feature(Feature::new(Origin::node(2))).await.unwrap();
        let missing = FeatureId::new("N3").unwrap();

        let features = store
            .get_features(&[b.clone(), missing, a.clone()])
            .await
            .unwrap();
        let ids: Vec<_> = features.into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn test_index_terms_conflict_is_atomic() {
        let store = SqliteStore::open_memory().unwrap();
        let a = store.put_feature(Feature::new(Origin::way(1))).await.unwrap();
        let b = store.put_feature(Feature::new(Origin::way(2))).await.unwrap();

        store
            .index_terms(&a, &[Term::new("main st", term_types::ADDRESS)])
            .await
            .unwrap();

        let err = store
            .index_terms(
                &b,
                &[
                    Term::new("elm st", term_types::ADDRESS),
                    Term::new("main st", term_types::ADDRESS),
                ],
            )
            .await
            .unwrap_err();
        match err {
            CacheError::TermConflict { term, bound_to } => {
                assert_eq!(term, "main st");
                assert_eq!(bound_to, "W1");
            }
            other => panic!("unexpected error: {other}"),
        }

        // "elm st" was first in the batch and must not have been written.
        assert!(store.lookup_term("elm st").await.unwrap_err().is_not_found());
        assert_eq!(store.lookup_term("main st").await.unwrap().feature_id, a);
    }

    #[tokio::test]
    async fn test_rebinding_same_feature_keeps_term_type() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.put_feature(central_park()).await.unwrap();

        store
            .index_terms(&id, &[Term::new("central park", term_types::NAME)])
            .await
            .unwrap();
        store
            .index_terms(&id, &[Term::new("central park", term_types::QUERY)])
            .await
            .unwrap();

        let binding = store.lookup_term("central park").await.unwrap();
        assert_eq!(binding.feature_id, id);
        assert_eq!(binding.term_type, term_types::NAME);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.terms, 1);
        assert_eq!(stats.terms_by_type.get(term_types::NAME), Some(&1));
        assert!(!stats.terms_by_type.contains_key(term_types::QUERY));
    }

    #[tokio::test]
    async fn test_index_terms_requires_feature() {
        let store = SqliteStore::open_memory().unwrap();
        let ghost = FeatureId::new("N404").unwrap();
        let err = store
            .index_terms(&ghost, &[Term::new("nowhere", term_types::NAME)])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::FeatureNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_cascades_terms() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store
            .upsert(
                central_park(),
                &[
                    Term::new("central park", term_types::NAME),
                    Term::new("10024", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.terms_for_feature(&id).await.unwrap().len(), 2);

        store.delete_feature(&id).await.unwrap();
        assert!(store.terms_for_feature(&id).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().terms, 0);
    }

    #[tokio::test]
    async fn test_remove_all_for_feature() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store
            .upsert(
                central_park(),
                &[
                    Term::new("central park", term_types::NAME),
                    Term::new("10024", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.remove_all_for_feature(&id).await.unwrap(), 2);
        assert_eq!(store.remove_all_for_feature(&id).await.unwrap(), 0);
        // Feature itself survives.
        assert!(store.get_feature(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_upsert_drops_stale_terms() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert(
                central_park(),
                &[
                    Term::new("central park", term_types::NAME),
                    Term::new("10024", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();

        let id = store
            .upsert(
                central_park(),
                &[
                    Term::new("central park", term_types::NAME),
                    Term::new("10025", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();

        let terms: Vec<_> = store
            .terms_for_feature(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.term)
            .collect();
        assert_eq!(terms, vec!["10025".to_string(), "central park".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_conflict_rolls_back_feature() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert(
                Feature::new(Origin::way(1)).with_name("A"),
                &[Term::new("main st", term_types::ADDRESS)],
            )
            .await
            .unwrap();

        let err = store
            .upsert(
                Feature::new(Origin::way(2)).with_name("B"),
                &[Term::new("main st", term_types::ADDRESS)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(store.find_by_origin(&Origin::way(2)).await.is_err());
        assert_eq!(
            store.resolve_term("main st").await.unwrap().name.as_deref(),
            Some("A")
        );
    }

    #[tokio::test]
    async fn test_scan_term_type_pages() {
        let store = SqliteStore::open_memory().unwrap();
        let id = store.put_feature(central_park()).await.unwrap();
        store
            .index_terms(
                &id,
                &[
                    Term::new("c", term_types::NAME),
                    Term::new("a", term_types::NAME),
                    Term::new("b", term_types::NAME),
                    Term::new("10024", term_types::POSTCODE),
                ],
            )
            .await
            .unwrap();

        let first = store.scan_term_type(term_types::NAME, None, 2).await.unwrap();
        let names: Vec<_> = first.iter().map(|e| e.term.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let rest = store
            .scan_term_type(term_types::NAME, Some("b"), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].term, "c");

        let postcodes = store
            .scan_term_type(term_types::POSTCODE, None, 10)
            .await
            .unwrap();
        assert_eq!(postcodes.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_detects_dangling_entry() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert(central_park(), &[Term::new("central park", term_types::NAME)])
            .await
            .unwrap();

        // Simulate corruption: drop the feature behind the index's back.
        store
            .with_writer(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = OFF; DELETE FROM feature; PRAGMA foreign_keys = ON;",
                )
                .map_err(storage_err)
            })
            .unwrap();

        let err = store.resolve_term("central park").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .upsert(central_park(), &[Term::new("central park", term_types::NAME)])
            .await
            .unwrap();
        store
            .upsert(
                Feature::new(Origin::node(9)),
                &[Term::new("somewhere", term_types::QUERY)],
            )
            .await
            .unwrap();

        let evicted = store.evict(&Origin::way(123)).await.unwrap();
        assert_eq!(evicted.as_str(), "W123");
        assert!(store.evict(&Origin::way(123)).await.unwrap_err().is_not_found());

        store.clear().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.features, 0);
        assert_eq!(stats.terms, 0);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let config = DatabaseConfig {
            read_connections: 2,
            ..DatabaseConfig::default()
        };

        {
            let store = SqliteStore::open(&path, &config).unwrap();
            store
                .upsert(central_park(), &[Term::new("central park", term_types::NAME)])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path, &config).unwrap();
        let feature = store.resolve_term("central park").await.unwrap();
        assert_eq!(feature, central_park());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.features, 1);
        assert_eq!(stats.terms_by_type.get(term_types::NAME), Some(&1));
        assert!(stats.storage_bytes > 0);

        drop(store);
        assert!(SqliteStore::delete_database(&path).unwrap());
        assert!(!path.exists());
        assert!(!SqliteStore::delete_database(&path).unwrap());
    }

    #[tokio::test]
    async fn test_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE unrelated (x INTEGER);").unwrap();
        }

        match SqliteStore::open(&path, &DatabaseConfig::default()) {
            Ok(_) => panic!("opened a database with foreign tables"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Storage),
        }
    }
}
