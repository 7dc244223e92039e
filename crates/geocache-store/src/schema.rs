//! Database schema definitions.

/// Main schema SQL for initializing the database.
///
/// Applied only to a database that has no tables yet.
pub const SCHEMA: &str = r#"
-- Resolved features, one per origin pair
CREATE TABLE feature (
    id TEXT PRIMARY KEY,
    osm_id INTEGER,
    osm_type TEXT,
    name TEXT,
    address TEXT,
    place_rank INTEGER,
    latitude REAL,
    longitude REAL,
    bounding_box TEXT,
    polygon TEXT
);

CREATE UNIQUE INDEX feature_osm_id_osm_type_idx ON feature (osm_id, osm_type);

-- Search term to feature bindings
CREATE TABLE feature_index (
    term TEXT PRIMARY KEY,
    term_type TEXT,
    feature_id TEXT,
    FOREIGN KEY (feature_id) REFERENCES feature (id)
        ON UPDATE RESTRICT
        ON DELETE CASCADE
);

CREATE INDEX feature_index_term_type_idx ON feature_index (term_type);
CREATE INDEX feature_index_feature_id_idx ON feature_index (feature_id);
"#;

/// Tables the schema creates, used to sanity-check existing databases.
pub const TABLES: [&str; 2] = ["feature", "feature_index"];
