//! bizmap command line
//!
//! Usage:
//!   bizmap --data-dir data consolidate --input licenses.geojson
//!   bizmap consolidate --strategy taxonomy --taxonomy industry-titles.csv --digits 4
//!   bizmap labels
//!   bizmap query --label "Tavern" --label "Grocery Stores" --clustering --eps 250
//!   bizmap overlay city com_areas
//!
//! Settings come from `--config` (TOML) and the environment; flags win.
//! Enable logging with `RUST_LOG=debug`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use bizmap::engine::error_status;
use bizmap::{
    run_batch, ClusterSelection, ConsolidationStrategy, HashingEmbedder, Linkage, Overlay, OverlayLayer, QueryEngine,
    QueryResponse, RepresentativePolicy, Result, Settings, SpatialClusterer, UnmappedPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consolidate raw records into category partitions
    Consolidate {
        /// Raw GeoJSON (overrides RAW_COMPANY_DATA)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// self_clustering or taxonomy_matching
        #[arg(long)]
        strategy: Option<ConsolidationStrategy>,

        /// Merge distance threshold (0.3 strict, 0.8 loose)
        #[arg(short, long)]
        threshold: Option<f64>,

        /// ward, average, complete or single
        #[arg(long)]
        linkage: Option<Linkage>,

        /// frequency or centroid
        #[arg(long)]
        representative: Option<RepresentativePolicy>,

        /// bucket or drop
        #[arg(long)]
        unmapped: Option<UnmappedPolicy>,

        /// Industry titles CSV for taxonomy matching
        #[arg(short = 'n', long)]
        taxonomy: Option<PathBuf>,

        /// Taxonomy code level (2-6)
        #[arg(long)]
        digits: Option<usize>,

        /// Embedding dimension of the hashing embedder
        #[arg(long, default_value = "384")]
        dimension: usize,
    },

    /// List canonical labels
    Labels,

    /// Print the GeoJSON of one or more labels
    Query {
        /// Canonical label, repeatable
        #[arg(short, long = "label", required = true)]
        labels: Vec<String>,

        /// Run density clustering
        #[arg(long)]
        clustering: bool,

        /// Cluster-selection distance in meters
        #[arg(long)]
        eps: Option<f64>,

        /// Minimum samples per core point
        #[arg(long)]
        min_samples: Option<usize>,

        /// leaf or eom
        #[arg(long)]
        selection: Option<ClusterSelection>,

        /// Print (lat, lon, name) triples instead of GeoJSON
        #[arg(long)]
        lean: bool,
    },

    /// Print boundary layers (city, neighborhoods, com_areas)
    Overlay {
        #[arg(required = true)]
        layers: Vec<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir;
    }

    match args.command {
        Command::Consolidate {
            input,
            strategy,
            threshold,
            linkage,
            representative,
            unmapped,
            taxonomy,
            digits,
            dimension,
        } => {
            if input.is_some() {
                settings.raw_company_data = input;
            }
            let consolidation = &mut settings.consolidation;
            if let Some(strategy) = strategy {
                consolidation.strategy = strategy;
            }
            if let Some(threshold) = threshold {
                consolidation.distance_threshold = threshold;
            }
            if let Some(linkage) = linkage {
                consolidation.linkage = linkage;
            }
            if let Some(representative) = representative {
                consolidation.representative = representative;
            }
            if let Some(unmapped) = unmapped {
                consolidation.unmapped = unmapped;
            }
            if taxonomy.is_some() {
                settings.taxonomy.file = taxonomy;
            }
            if let Some(digits) = digits {
                settings.taxonomy.digits = digits;
            }
            settings.validate()?;

            let report = run_batch(&settings, Arc::new(HashingEmbedder::new(dimension)))?;
            println!(
                "{} records -> {} categories ({} raw labels, {} dropped)",
                report.records_written, report.canonical_labels, report.raw_labels, report.records_dropped
            );
        }

        Command::Labels => {
            let engine = QueryEngine::from_settings(&settings)?;
            for label in engine.list_canonical_labels() {
                println!("{}", label);
            }
        }

        Command::Query {
            labels,
            clustering,
            eps,
            min_samples,
            selection,
            lean,
        } => {
            if let Some(selection) = selection {
                settings.clustering.selection = selection;
            }
            settings.validate()?;
            // Fail early on a bad projection before loading the data
            SpatialClusterer::from_config(&settings.clustering)?;
            let engine = QueryEngine::from_settings(&settings)?;

            if lean {
                let points = engine.get_lean_points(&labels);
                let json = serde_json::to_string(&points).map_err(|e| bizmap::BizmapError::Serialization {
                    message: e.to_string(),
                })?;
                println!("{}", json);
                return Ok(());
            }

            let eps = eps.unwrap_or(settings.clustering.epsilon);
            let min_samples = min_samples.unwrap_or(settings.clustering.min_samples);
            match engine.filter_and_cluster(&labels, clustering, eps, min_samples) {
                Ok(response) => match &*response {
                    QueryResponse::Features(json) => println!("{}", json),
                    QueryResponse::Empty => {
                        log::info!("No records for {:?} (status {})", labels, response.status_code())
                    }
                },
                Err(e) => {
                    log::error!("Query failed (status {}): {}", error_status(&e), e);
                    return Err(e);
                }
            }
        }

        Command::Overlay { layers } => {
            let overlay = Overlay::load_named(&settings.overlays, &layers)?;
            let mut out = serde_json::Map::new();
            for layer in OverlayLayer::ALL {
                if let Some(value) = overlay.layer(layer) {
                    out.insert(layer.to_string(), value.clone());
                }
            }
            println!("{}", serde_json::Value::Object(out));
        }
    }
    Ok(())
}
