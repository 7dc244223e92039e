//! Core domain types for the feature cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CacheError, Result};

/// Well-known term categories used by the normalization pipeline.
pub mod term_types {
    pub const NAME: &str = "name";
    pub const ADDRESS: &str = "address";
    pub const POSTCODE: &str = "postcode";
    /// Free-text geocoding query.
    pub const QUERY: &str = "query";
    /// "lat, lon" string used for reverse geocoding.
    pub const COORDINATE: &str = "coordinate";
}

/// Identifier of a feature in its source system (e.g. an OSM element).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    /// Id within the source system.
    #[serde(rename = "osm_id")]
    pub id: i64,

    /// Element type within the source system ("node", "way", "relation", ...).
    #[serde(rename = "osm_type")]
    pub kind: String,
}

impl Origin {
    pub fn new(id: i64, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
        }
    }

    pub fn node(id: i64) -> Self {
        Self::new(id, "node")
    }

    pub fn way(id: i64) -> Self {
        Self::new(id, "way")
    }

    pub fn relation(id: i64) -> Self {
        Self::new(id, "relation")
    }

    /// Single-letter OSM element code, if this is an OSM element type.
    fn osm_letter(&self) -> Option<char> {
        match self.kind.as_str() {
            "node" => Some('N'),
            "way" => Some('W'),
            "relation" => Some('R'),
            _ => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Opaque, immutable feature identifier.
///
/// Derived from the origin pair unless a caller supplies one explicitly:
/// OSM elements become `N123` / `W123` / `R123`, any other origin type
/// becomes `<type>/<id>`. The two forms cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    /// Wrap an explicit id. Empty ids are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CacheError::InvalidFeatureId { id });
        }
        Ok(Self(id))
    }

    /// Derive the canonical id for an origin pair.
    pub fn from_origin(origin: &Origin) -> Self {
        match origin.osm_letter() {
            Some(letter) => Self(format!("{}{}", letter, origin.id)),
            None => Self(format!("{}/{}", origin.kind, origin.id)),
        }
    }

    /// Recover the origin pair from a derived id.
    pub fn parse_origin(&self) -> Result<Origin> {
        let invalid = || CacheError::InvalidFeatureId { id: self.0.clone() };

        if let Some((kind, id)) = self.0.rsplit_once('/') {
            if kind.is_empty() {
                return Err(invalid());
            }
            let id: i64 = id.parse().map_err(|_| invalid())?;
            return Ok(Origin::new(id, kind));
        }

        let mut chars = self.0.chars();
        let kind = match chars.next() {
            Some('N') => "node",
            Some('W') => "way",
            Some('R') => "relation",
            _ => return Err(invalid()),
        };
        let digits = chars.as_str();
        let unsigned = digits.strip_prefix('-').unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let id: i64 = digits.parse().map_err(|_| invalid())?;
        Ok(Origin::new(id, kind))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FeatureId {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// A resolved geographic entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Primary key.
    pub id: FeatureId,

    /// Source-system identity; unique across the cache.
    #[serde(flatten)]
    pub origin: Origin,

    /// Display name.
    pub name: Option<String>,

    /// Display address (the pipeline stores a JSON object here).
    pub address: Option<String>,

    /// Specificity rank: lower is broader (country), higher is narrower (building).
    pub place_rank: Option<i64>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    /// Opaque serialized geometry.
    pub bounding_box: Option<String>,

    /// Opaque serialized geometry.
    pub polygon: Option<String>,
}

impl Feature {
    /// Create a feature whose id is derived from its origin.
    pub fn new(origin: Origin) -> Self {
        Self {
            id: FeatureId::from_origin(&origin),
            origin,
            name: None,
            address: None,
            place_rank: None,
            latitude: None,
            longitude: None,
            bounding_box: None,
            polygon: None,
        }
    }

    /// Use an explicit id instead of the derived one.
    pub fn with_id(mut self, id: FeatureId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_place_rank(mut self, rank: i64) -> Self {
        self.place_rank = Some(rank);
        self
    }

    pub fn with_centroid(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_bounding_box(mut self, bbox: impl Into<String>) -> Self {
        self.bounding_box = Some(bbox.into());
        self
    }

    pub fn with_polygon(mut self, polygon: impl Into<String>) -> Self {
        self.polygon = Some(polygon.into());
        self
    }
}

/// A term to bind to a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub term: String,
    pub term_type: String,
}

impl Term {
    pub fn new(term: impl Into<String>, term_type: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            term_type: term_type.into(),
        }
    }
}

/// Result of a single-term lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermBinding {
    pub feature_id: FeatureId,
    pub term_type: String,
}

/// A stored term index row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub term: String,
    pub term_type: String,
    pub feature_id: FeatureId,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of features.
    pub features: u64,

    /// Number of term index entries.
    pub terms: u64,

    /// Index entries per term type.
    pub terms_by_type: BTreeMap<String, u64>,

    /// Database size in bytes (0 for in-memory backends).
    pub storage_bytes: u64,
}

/// Check a term batch before it reaches storage.
///
/// Empty terms or term types are rejected. A term listed twice keeps its
/// last term type.
pub fn normalize_batch(terms: &[Term]) -> Result<Vec<Term>> {
    let mut out: Vec<Term> = Vec::with_capacity(terms.len());
    for t in terms {
        if t.term.is_empty() {
            return Err(CacheError::invalid_argument("term must not be empty"));
        }
        if t.term_type.is_empty() {
            return Err(CacheError::invalid_argument(format!(
                "term {:?} has an empty term type",
                t.term
            )));
        }
        match out.iter_mut().find(|existing| existing.term == t.term) {
            Some(existing) => existing.term_type = t.term_type.clone(),
            None => out.push(t.clone()),
        }
    }
    Ok(out)
}
