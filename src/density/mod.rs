//! # Spatial Density Clustering
//!
//! Wraps [`hdbscan`] for record collections: reprojects geographic points to
//! UTM so epsilon is a ground distance in meters, extracts planar
//! coordinates in record order and returns positional labels.

pub mod hdbscan;
pub mod rtree;

use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::error::{BizmapError, Result};
use crate::records::GeoRecordCollection;

pub use hdbscan::{ClusterSelection, HdbscanParams, NOISE};

/// Default clustering parameters for queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster-selection distance in meters
    pub epsilon: f64,
    pub min_samples: usize,
    /// Worker threads per clustering call
    pub workers: usize,
    pub selection: ClusterSelection,
    /// Projected CRS for distances; derived from the data when unset
    pub projection: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.02,
            min_samples: 5,
            workers: 4,
            selection: ClusterSelection::Leaf,
            projection: None,
        }
    }
}

/// Per-record cluster labels attached to a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterColumn {
    /// Clustering was not asked for.
    NotRequested,
    /// One label per record, `-1` for noise.
    Assigned(Vec<i32>),
    /// Clustering failed; records are served unclustered.
    Failed { reason: String },
}

impl ClusterColumn {
    pub fn labels(&self) -> Option<&[i32]> {
        match self {
            ClusterColumn::Assigned(labels) => Some(labels),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ClusterColumn::Failed { .. })
    }
}

/// Density clusterer for record collections.
#[derive(Debug, Clone)]
pub struct SpatialClusterer {
    selection: ClusterSelection,
    projection: Option<Crs>,
}

impl SpatialClusterer {
    /// `projection` must be a projected CRS when given.
    pub fn new(selection: ClusterSelection, projection: Option<Crs>) -> Result<Self> {
        if let Some(crs) = projection.filter(|c| !c.is_projected()) {
            return Err(BizmapError::UnsupportedCrs {
                crs: format!("{} is not projected", crs),
            });
        }
        Ok(Self { selection, projection })
    }

    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let projection = config.projection.as_deref().map(str::parse::<Crs>).transpose()?;
        Self::new(config.selection, projection)
    }

    /// Projected CRS used for `collection`.
    pub fn projection_for(&self, collection: &GeoRecordCollection) -> Crs {
        if let Some(crs) = self.projection {
            return crs;
        }
        if collection.crs().is_projected() {
            return collection.crs();
        }
        let (lon, lat) = collection.mean_position().unwrap_or((0.0, 0.0));
        Crs::utm_for(lon, lat)
    }

    /// Cluster `collection` and return one label per record.
    pub fn cluster(
        &self,
        collection: &GeoRecordCollection,
        epsilon: f64,
        min_samples: usize,
        workers: usize,
    ) -> Result<Vec<i32>> {
        let n = collection.len();
        if n < min_samples {
            log::debug!(
                "[Clusterer] {} records below min_samples {}, all noise",
                n,
                min_samples
            );
            return Ok(vec![NOISE; n]);
        }

        let target = self.projection_for(collection);
        let projected = collection.reproject(target);
        let coords: Vec<[f64; 2]> = projected
            .records()
            .iter()
            .map(|r| [r.geometry.x(), r.geometry.y()])
            .collect();

        let params = HdbscanParams {
            min_samples,
            epsilon,
            selection: self.selection,
            workers: workers.max(1),
        };
        let labels = hdbscan::hdbscan(&coords, &params)?;
        if labels.len() != n {
            return Err(BizmapError::ClusteringFailed {
                message: format!("{} labels for {} records", labels.len(), n),
            });
        }

        log::info!(
            "[Clusterer] {} records in {}: {} clusters, {} noise",
            n,
            target,
            labels.iter().copied().max().map_or(0, |m| m + 1),
            labels.iter().filter(|&&l| l == NOISE).count()
        );
        Ok(labels)
    }

    /// Cluster, turning failures into a logged [`ClusterColumn::Failed`].
    pub fn cluster_or_degrade(
        &self,
        collection: &GeoRecordCollection,
        epsilon: f64,
        min_samples: usize,
        workers: usize,
    ) -> ClusterColumn {
        match self.cluster(collection, epsilon, min_samples, workers) {
            Ok(labels) => ClusterColumn::Assigned(labels),
            Err(e) => {
                log::error!("[Clusterer] Clustering failed, serving unclustered records: {}", e);
                ClusterColumn::Failed { reason: e.to_string() }
            }
        }
    }
}

impl Default for SpatialClusterer {
    fn default() -> Self {
        Self {
            selection: ClusterSelection::default(),
            projection: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::utm_to_geographic;
    use crate::records::RawActivityRecord;

    fn pair_1000m_apart() -> GeoRecordCollection {
        let (lon_a, lat_a) = utm_to_geographic(16, true, 447_742.0, 4_636_434.0);
        let (lon_b, lat_b) = utm_to_geographic(16, true, 448_742.0, 4_636_434.0);
        GeoRecordCollection::new(
            Crs::Wgs84,
            vec![
                RawActivityRecord::new("a", None, "A", lon_a, lat_a),
                RawActivityRecord::new("b", None, "B", lon_b, lat_b),
            ],
        )
    }

    #[test]
    fn test_epsilon_is_in_meters() {
        let clusterer = SpatialClusterer::default();
        let pair = pair_1000m_apart();
        assert_eq!(
            clusterer.projection_for(&pair),
            Crs::Utm {
                zone: 16,
                north: true
            }
        );
        assert_eq!(clusterer.cluster(&pair, 1001.0, 2, 1).unwrap(), vec![0, 0]);
        assert_eq!(clusterer.cluster(&pair, 999.0, 2, 1).unwrap(), vec![-1, -1]);
    }

    #[test]
    fn test_small_collection_is_noise() {
        let clusterer = SpatialClusterer::default();
        assert_eq!(clusterer.cluster(&pair_1000m_apart(), 5000.0, 3, 1).unwrap(), vec![-1, -1]);
    }

    #[test]
    fn test_failure_degrades() {
        let clusterer = SpatialClusterer::default();
        let column = clusterer.cluster_or_degrade(&pair_1000m_apart(), f64::NAN, 2, 1);
        assert!(column.is_failed());
        assert!(column.labels().is_none());
    }

    #[test]
    fn test_rejects_geographic_projection() {
        assert!(SpatialClusterer::new(ClusterSelection::Leaf, Some(Crs::Wgs84)).is_err());
        let config = ClusterConfig {
            projection: Some("EPSG:32616".to_string()),
            ..ClusterConfig::default()
        };
        assert!(SpatialClusterer::from_config(&config).is_ok());
    }
}
