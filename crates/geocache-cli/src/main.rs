//! geocache CLI - Inspect and maintain the geocoding feature cache.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use geocache_core::{CacheConfig, CacheError, Feature, FeatureId, Origin, Term};
use geocache_engine::GeoCache;
use geocache_store::SqliteStore;

/// geocache - Persistent cache of resolved geographic features
#[derive(Parser)]
#[command(name = "geocache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (default: <data dir>/geocache/cache.db)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Config file (default: <config dir>/geocache/config.toml, then ./geocache.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Resolve a term to its cached feature
    Resolve {
        /// Search term, exactly as indexed
        term: String,
    },

    /// Show the raw index binding of a term
    Lookup {
        term: String,
    },

    /// Find the feature for an origin pair
    Find {
        /// Origin type, e.g. node, way, relation
        origin_type: String,

        /// Origin id
        origin_id: i64,
    },

    /// Fetch features by id
    Get {
        /// Feature ids, e.g. W123
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Upsert features from a JSON lines file ("-" for stdin)
    Import {
        path: PathBuf,
    },

    /// Evict the feature for an origin pair and all of its terms
    Evict {
        origin_type: String,
        origin_id: i64,
    },

    /// Export every index entry of a term type as JSON lines
    Export {
        /// Term type, e.g. name, postcode, query
        term_type: String,
    },

    /// Show statistics
    Stats,

    /// Remove every cached feature
    Clear {
        /// Delete the database file instead of emptying it
        #[arg(long)]
        delete_db: bool,
    },
}

/// One line of an import file.
#[derive(Debug, Deserialize)]
struct ImportRecord {
    feature: ImportFeature,

    #[serde(default)]
    terms: Vec<Term>,
}

/// Feature as written by the pipeline; `id` is derived when omitted.
#[derive(Debug, Deserialize)]
struct ImportFeature {
    id: Option<String>,
    osm_id: i64,
    osm_type: String,
    name: Option<String>,
    address: Option<String>,
    place_rank: Option<i64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    bounding_box: Option<String>,
    polygon: Option<String>,
}

impl ImportFeature {
    fn into_feature(self) -> Result<Feature, CacheError> {
        let mut feature = Feature::new(Origin::new(self.osm_id, self.osm_type));
        if let Some(id) = self.id {
            feature = feature.with_id(FeatureId::new(id)?);
        }
        feature.name = self.name;
        feature.address = self.address;
        feature.place_rank = self.place_rank;
        feature.latitude = self.latitude;
        feature.longitude = self.longitude;
        feature.bounding_box = self.bounding_box;
        feature.polygon = self.polygon;
        Ok(feature)
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(cli: &Cli) -> Result<CacheConfig, CacheError> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::load_default()?,
    };
    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;

    // Deleting the file must not open it first.
    if let Commands::Clear { delete_db: true } = cli.command {
        if SqliteStore::delete_database(&config.database.path)? {
            println!("Deleted {}", config.database.path.display());
        } else {
            println!("No database at {}", config.database.path.display());
        }
        return Ok(());
    }

    let cache = GeoCache::open(&config)?;

    let outcome = match cli.command {
        Commands::Init => {
            println!("Initialized database at: {}", config.database.path.display());
            Ok(())
        }
        Commands::Resolve { term } => cache.resolve(&term).await.and_then(|f| print_json(&f)),
        Commands::Lookup { term } => cache.lookup(&term).await.and_then(|b| print_json(&b)),
        Commands::Find {
            origin_type,
            origin_id,
        } => cache
            .find_by_origin(&Origin::new(origin_id, origin_type))
            .await
            .and_then(|f| print_json(&f)),
        Commands::Get { ids } => get(&cache, ids).await,
        Commands::Import { path } => import(&cache, &path).await,
        Commands::Evict {
            origin_type,
            origin_id,
        } => cache
            .evict(&Origin::new(origin_id, origin_type))
            .await
            .map(|id| println!("Evicted {}", id)),
        Commands::Export { term_type } => export(&cache, &term_type).await,
        Commands::Stats => cache.stats().await.and_then(|s| print_json(&s)),
        Commands::Clear { .. } => cache.clear().await.map(|_| println!("Cache cleared")),
    };

    if let Err(e) = outcome {
        eprintln!("Error [{}]: {}", e.error_code(), e);
        std::process::exit(if e.is_not_found() { 2 } else { 1 });
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CacheError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn get(cache: &GeoCache, ids: Vec<String>) -> Result<(), CacheError> {
    let ids = ids
        .into_iter()
        .map(FeatureId::new)
        .collect::<Result<Vec<_>, _>>()?;
    let features = cache.get_many(&ids).await?;
    if features.len() < ids.len() {
        eprintln!("{} of {} features not cached", ids.len() - features.len(), ids.len());
    }
    print_json(&features)
}

async fn import(cache: &GeoCache, path: &PathBuf) -> Result<(), CacheError> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(fs::File::open(path)?))
    };

    let mut success_count = 0;
    let mut error_count = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: ImportRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("  line {}: {}", index + 1, e);
                error_count += 1;
                continue;
            }
        };

        let result = match record.feature.into_feature() {
            Ok(feature) => cache.upsert(feature, &record.terms).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(id) => {
                println!("  {} - OK", id);
                success_count += 1;
            }
            Err(e) if e.kind() == geocache_core::ErrorKind::Storage => return Err(e),
            Err(e) => {
                eprintln!("  line {}: {}", index + 1, e);
                error_count += 1;
            }
        }
    }

    println!(
        "\nComplete: {} succeeded, {} failed",
        success_count, error_count
    );

    Ok(())
}

async fn export(cache: &GeoCache, term_type: &str) -> Result<(), CacheError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut scan = cache.lookup_by_type(term_type);
    let mut count = 0;

    while let Some(entry) = scan.next().await? {
        serde_json::to_writer(&mut out, &entry)?;
        writeln!(out)?;
        count += 1;
    }

    tracing::info!("Exported {} {:?} entries", count, term_type);
    Ok(())
}
