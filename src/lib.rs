//! # bizmap
//!
//! Consolidation and spatial density clustering of business-license records.
//!
//! This library provides:
//! - Label consolidation: free-text activity descriptions collapsed into
//!   canonical categories with embeddings and agglomerative clustering,
//!   optionally snapped to an industry taxonomy first
//! - A partition store with one file per canonical category
//! - HDBSCAN density clustering in UTM meters
//! - A query engine with a bounded single-flight LRU cache
//!
//! ## Features
//!
//! - **`parallel`** - Parallel core distances, spanning trees and distance
//!   matrices with rayon (default)
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use bizmap::{Crs, EngineConfig, GeoRecordCollection, MasterCollection, QueryEngine, RawActivityRecord};
//!
//! let records = vec![
//!     RawActivityRecord::new("1", Some("Tavern".into()), "Old Town Ale", -87.64, 41.91)
//!         .with_category("Tavern", None),
//! ];
//! let master = MasterCollection::new(GeoRecordCollection::new(Crs::Wgs84, records));
//! let engine = QueryEngine::new(Arc::new(master), EngineConfig::default());
//!
//! let response = engine.filter_and_cluster(&["Tavern"], false, 0.0, 0).unwrap();
//! assert_eq!(response.status_code(), 200);
//! ```

// Unified error handling
pub mod error;
pub use error::{BizmapError, OptionExt, Result};

// Union-Find for dendrogram cuts and component merging
pub mod union_find;
pub use union_find::UnionFind;

// Bounded LRU cache with single-flight computation
pub mod lru_cache;
pub use lru_cache::LruCache;

// Coordinate reference systems and UTM projection
pub mod crs;
pub use crs::Crs;

// Records and collections
pub mod records;
pub use records::{GeoRecordCollection, MasterCollection, RawActivityRecord, UNCLASSIFIED};

// Text embedding capability
pub mod embedding;
pub use embedding::{HashingEmbedder, TextEmbedder};

// Label consolidation
pub mod consolidation;
pub use consolidation::{
    ConsolidationConfig, ConsolidationStrategy, LabelConsolidator, LabelFrequencies, LabelMapping, Linkage,
    RepresentativePolicy, Taxonomy, UnmappedPolicy,
};

// Spatial density clustering
pub mod density;
pub use density::{ClusterColumn, ClusterConfig, ClusterSelection, SpatialClusterer};

// On-disk partitions, mapping index and GeoJSON
pub mod storage;
pub use storage::{sanitize_label, PartitionStore};

// Boundary overlays
pub mod overlay;
pub use overlay::{Overlay, OverlayLayer};

// Settings
pub mod config;
pub use config::Settings;

// Batch pipeline
pub mod ingest;
pub use ingest::{run_batch, IngestReport};

// Query engine
pub mod engine;
pub use engine::{EngineConfig, LeanPoint, QueryEngine, QueryResponse, QueryStats};
