//! # Query Engine
//!
//! Serves category queries over the immutable master collection:
//! - Filter records by canonical label
//! - Optionally density-cluster the result
//! - Serialize to GeoJSON once and memoize it in a bounded LRU cache
//!
//! The engine is `Send + Sync`; share it behind an `Arc` and query it from
//! any number of threads. Reloading the master means building a new engine,
//! which drops the whole cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::Settings;
use crate::crs::Crs;
use crate::density::{ClusterColumn, SpatialClusterer};
use crate::error::{BizmapError, Result};
use crate::lru_cache::LruCache;
use crate::records::MasterCollection;
use crate::storage::geojson::to_feature_collection;
use crate::storage::PartitionStore;

/// HTTP-equivalent status of a served result.
pub const STATUS_OK: u16 = 200;
pub const STATUS_NO_CONTENT: u16 = 204;
pub const STATUS_SERVER_ERROR: u16 = 500;

/// Normalized cache key of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    labels: Vec<String>,
    clustering: bool,
    epsilon_bits: u64,
    min_samples: usize,
}

impl QueryKey {
    /// Sort and deduplicate labels; zero the clustering parameters when
    /// clustering is off so they cannot split the cache.
    pub fn new<S: AsRef<str>>(labels: &[S], clustering: bool, epsilon: f64, min_samples: usize) -> Self {
        let mut labels: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        labels.sort();
        labels.dedup();
        let (epsilon, min_samples) = if clustering { (epsilon, min_samples) } else { (0.0, 0) };
        // -0.0 and 0.0 are the same query
        let epsilon = if epsilon == 0.0 { 0.0 } else { epsilon };
        Self {
            labels,
            clustering,
            epsilon_bits: epsilon.to_bits(),
            min_samples,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn clustering(&self) -> bool {
        self.clustering
    }

    pub fn epsilon(&self) -> f64 {
        f64::from_bits(self.epsilon_bits)
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }
}

/// Result of a feature query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    /// No record matched.
    Empty,
    /// Serialized GeoJSON FeatureCollection.
    Features(String),
}

impl QueryResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            QueryResponse::Empty => STATUS_NO_CONTENT,
            QueryResponse::Features(_) => STATUS_OK,
        }
    }

    pub fn as_json(&self) -> Option<&str> {
        match self {
            QueryResponse::Empty => None,
            QueryResponse::Features(json) => Some(json),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QueryResponse::Empty)
    }
}

/// Why a computed response stays out of the cache.
enum Uncached {
    Error(BizmapError),
    /// Served, but clustering failed and a retry may succeed.
    Degraded(QueryResponse),
}

impl From<BizmapError> for Uncached {
    fn from(error: BizmapError) -> Self {
        Uncached::Error(error)
    }
}

/// Status for a query that returned an error.
pub fn error_status(_error: &BizmapError) -> u16 {
    STATUS_SERVER_ERROR
}

/// `(latitude, longitude, display name)` in WGS84.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeanPoint(pub f64, pub f64, pub String);

/// Engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueryStats {
    pub master_records: usize,
    pub cached_entries: usize,
    pub computations: u64,
    pub cache_hits: u64,
}

/// Engine parameters that are fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_capacity: usize,
    pub output_crs: Crs,
    /// Worker threads per clustering call
    pub workers: usize,
    pub clusterer: SpatialClusterer,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 128,
            output_crs: Crs::Wgs84,
            workers: 4,
            clusterer: SpatialClusterer::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            cache_capacity: settings.cache_capacity,
            output_crs: settings.output_crs()?,
            workers: settings.clustering.workers.max(1),
            clusterer: SpatialClusterer::from_config(&settings.clustering)?,
        })
    }
}

/// Cached filter-and-cluster queries over one master collection.
pub struct QueryEngine {
    master: Arc<MasterCollection>,
    cache: LruCache<QueryKey, QueryResponse>,
    config: EngineConfig,
    computations: AtomicU64,
    cache_hits: AtomicU64,
}

impl QueryEngine {
    pub fn new(master: Arc<MasterCollection>, config: EngineConfig) -> Self {
        log::info!(
            "[Engine] Serving {} records in {} categories (cache capacity {})",
            master.len(),
            master.categories().len(),
            config.cache_capacity
        );
        Self {
            master,
            cache: LruCache::new(config.cache_capacity),
            config,
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Load the master collection from the configured store.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = EngineConfig::from_settings(settings)?;
        let master = PartitionStore::open(&settings.data_dir).load_master()?;
        Ok(Self::new(Arc::new(master), config))
    }

    pub fn master(&self) -> &Arc<MasterCollection> {
        &self.master
    }

    /// Canonical labels present in the master collection, sorted.
    pub fn list_canonical_labels(&self) -> Vec<String> {
        self.master.categories()
    }

    /// Records of `labels`, optionally clustered, as GeoJSON.
    ///
    /// An empty label list returns [`QueryResponse::Empty`] without touching
    /// the data. Clustering failures are served as unclustered features with
    /// a `clustering` failure member and are not cached.
    pub fn filter_and_cluster<S: AsRef<str>>(
        &self,
        labels: &[S],
        clustering: bool,
        epsilon: f64,
        min_samples: usize,
    ) -> Result<Arc<QueryResponse>> {
        if labels.is_empty() {
            return Ok(Arc::new(QueryResponse::Empty));
        }
        if clustering {
            if !epsilon.is_finite() || epsilon < 0.0 {
                return Err(BizmapError::invalid("epsilon", format!("{} is not a non-negative distance", epsilon)));
            }
            if min_samples == 0 {
                return Err(BizmapError::invalid("min_samples", "must be at least 1"));
            }
        }

        let key = QueryKey::new(labels, clustering, epsilon, min_samples);
        let mut computed = false;
        let result = self.cache.get_or_compute(key.clone(), || {
            computed = true;
            self.compute(&key)
        });
        let response = match result {
            Ok(response) => response,
            Err(Uncached::Error(e)) => return Err(e),
            Err(Uncached::Degraded(response)) => {
                self.computations.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Engine] Not caching degraded response for {:?}", key.labels());
                return Ok(Arc::new(response));
            }
        };

        if computed {
            self.computations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("[Engine] Cache hit for {:?}", key.labels());
        }
        Ok(response)
    }

    fn compute(&self, key: &QueryKey) -> std::result::Result<QueryResponse, Uncached> {
        for label in key.labels().iter().filter(|l| !self.master.contains_category(l)) {
            log::warn!("[Engine] No records for category '{}', skipping", label);
        }

        let filtered = self.master.filter(key.labels());
        if filtered.is_empty() {
            return Ok(QueryResponse::Empty);
        }

        let column = if key.clustering() {
            self.config
                .clusterer
                .cluster_or_degrade(&filtered, key.epsilon(), key.min_samples(), self.config.workers)
        } else {
            ClusterColumn::NotRequested
        };

        let value = to_feature_collection(&filtered, &column, self.config.output_crs);
        let json = serde_json::to_string(&value).map_err(BizmapError::serialization)?;
        log::info!(
            "[Engine] Computed {} features for {} categories ({} bytes)",
            filtered.len(),
            key.labels().len(),
            json.len()
        );
        if column.is_failed() {
            return Err(Uncached::Degraded(QueryResponse::Features(json)));
        }
        Ok(QueryResponse::Features(json))
    }

    /// Points of `labels` without clustering or serialization.
    pub fn get_lean_points<S: AsRef<str>>(&self, labels: &[S]) -> Vec<LeanPoint> {
        if labels.is_empty() {
            return Vec::new();
        }
        self.master
            .filter(labels)
            .reproject(Crs::Wgs84)
            .into_records()
            .into_iter()
            .map(|r| LeanPoint(r.geometry.y(), r.geometry.x(), r.name))
            .collect()
    }

    pub fn stats(&self) -> QueryStats {
        QueryStats {
            master_records: self.master.len(),
            cached_entries: self.cache.len(),
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached response.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{GeoRecordCollection, RawActivityRecord};

    fn engine(capacity: usize) -> QueryEngine {
        let records = vec![
            RawActivityRecord::new("1", Some("tavern".into()), "Old Town Ale", -87.64, 41.91).with_category("Bars", None),
            RawActivityRecord::new("2", Some("deli".into()), "Corner Deli", -87.63, 41.88).with_category("Food", None),
            RawActivityRecord::new("3", Some("pub".into()), "The Pub", -87.65, 41.92).with_category("Bars", None),
        ];
        let master = MasterCollection::new(GeoRecordCollection::new(Crs::Wgs84, records));
        QueryEngine::new(
            Arc::new(master),
            EngineConfig {
                cache_capacity: capacity,
                ..EngineConfig::default()
            },
        )
    }

    #[test]
    fn test_key_normalization() {
        let a = QueryKey::new(&["b", "a", "b"], false, 5.0, 9);
        let b = QueryKey::new(&["a", "b"], false, 0.02, 5);
        assert_eq!(a, b);
        assert_eq!(a.labels(), &["a".to_string(), "b".to_string()]);

        let c = QueryKey::new(&["a"], true, -0.0, 5);
        let d = QueryKey::new(&["a"], true, 0.0, 5);
        assert_eq!(c, d);
        assert_ne!(QueryKey::new(&["a"], true, 1.0, 5), QueryKey::new(&["a"], true, 2.0, 5));
    }

    #[test]
    fn test_empty_request() {
        let engine = engine(4);
        let empty: [&str; 0] = [];
        let response = engine.filter_and_cluster(&empty, true, 1.0, 2).unwrap();
        assert_eq!(*response, QueryResponse::Empty);
        assert_eq!(response.status_code(), STATUS_NO_CONTENT);
        assert_eq!(engine.stats().computations, 0);
        assert_eq!(engine.stats().cached_entries, 0);
    }

    #[test]
    fn test_unknown_label_is_cached_empty() {
        let engine = engine(4);
        let first = engine.filter_and_cluster(&["Nope"], false, 0.0, 0).unwrap();
        let second = engine.filter_and_cluster(&["Nope"], false, 0.0, 0).unwrap();
        assert!(first.is_empty());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.stats().computations, 1);
        assert_eq!(engine.stats().cache_hits, 1);
    }

    #[test]
    fn test_features_in_master_order() {
        let engine = engine(4);
        let response = engine.filter_and_cluster(&["Bars"], false, 0.0, 0).unwrap();
        let value: serde_json::Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
        let features = value["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["properties"]["id"], "1");
        assert_eq!(features[1]["properties"]["id"], "3");
        assert!(features[0]["properties"].get("cluster").is_none());
    }

    #[test]
    fn test_invalid_parameters_not_cached() {
        let engine = engine(4);
        assert!(engine.filter_and_cluster(&["Bars"], true, f64::NAN, 2).is_err());
        assert!(engine.filter_and_cluster(&["Bars"], true, 1.0, 0).is_err());
        assert_eq!(engine.stats().cached_entries, 0);
    }

    #[test]
    fn test_degraded_clustering_not_cached() {
        let records = vec![
            RawActivityRecord::new("1", None, "Nowhere", f64::NAN, 41.9).with_category("Broken", None),
            RawActivityRecord::new("2", None, "Nowhere Else", f64::NAN, 41.8).with_category("Broken", None),
        ];
        let master = MasterCollection::new(GeoRecordCollection::new(Crs::Wgs84, records));
        let engine = QueryEngine::new(Arc::new(master), EngineConfig::default());

        for _ in 0..2 {
            let response = engine.filter_and_cluster(&["Broken"], true, 0.0, 1).unwrap();
            assert_eq!(response.status_code(), STATUS_OK);
            let value: serde_json::Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
            assert_eq!(value["clustering"]["status"], "failed");
            assert_eq!(value["features"].as_array().unwrap().len(), 2);
        }

        let stats = engine.stats();
        assert_eq!(stats.cached_entries, 0);
        assert_eq!(stats.computations, 2);
        assert_eq!(stats.cache_hits, 0);
    }

    #[test]
    fn test_lean_points() {
        let engine = engine(4);
        let points = engine.get_lean_points(&["Food"]);
        assert_eq!(points, vec![LeanPoint(41.88, -87.63, "Corner Deli".to_string())]);
        let none: [&str; 0] = [];
        assert!(engine.get_lean_points(&none).is_empty());
    }

    #[test]
    fn test_labels_listed_sorted() {
        assert_eq!(
            engine(2).list_canonical_labels(),
            vec!["Bars".to_string(), "Food".to_string()]
        );
    }
}
