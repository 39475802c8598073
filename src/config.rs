//! Runtime settings.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (`DATA_DIR`, `CRS`, `ACT`, `NAME`, `DESC`, `CITY_FILE`,
//! `NEIGH_FILE`, `COM_AREAS_FILE`, `RAW_COMPANY_DATA`, `CACHE_CAPACITY`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consolidation::ConsolidationConfig;
use crate::crs::Crs;
use crate::density::ClusterConfig;
use crate::error::{BizmapError, Result};
use crate::overlay::OverlayPaths;
use crate::storage::geojson::ColumnNames;

/// Taxonomy source for taxonomy matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// Titles CSV with an `industry_title` column
    pub file: Option<PathBuf>,
    /// Code level, 2 to 6 digits
    pub digits: usize,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self { file: None, digits: 4 }
    }
}

/// All settings of the batch pipeline and the query engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Partition store directory
    pub data_dir: PathBuf,
    /// Raw license GeoJSON
    pub raw_company_data: Option<PathBuf>,
    /// CRS of the raw data and of served output
    pub crs: String,
    pub columns: ColumnNames,
    pub overlays: OverlayPaths,
    /// Query cache entries
    pub cache_capacity: usize,
    pub clustering: ClusterConfig,
    pub consolidation: ConsolidationConfig,
    pub taxonomy: TaxonomyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/processed"),
            raw_company_data: None,
            crs: "EPSG:4326".to_string(),
            columns: ColumnNames::default(),
            overlays: OverlayPaths::default(),
            cache_capacity: 128,
            clustering: ClusterConfig::default(),
            consolidation: ConsolidationConfig::default(),
            taxonomy: TaxonomyConfig::default(),
        }
    }
}

impl Settings {
    /// Load `path` (if any), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| BizmapError::io(path, e))?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BizmapError::Config {
            message: format!("invalid settings: {}", e),
        })
    }

    /// Apply overrides from `lookup` (the process environment in [`Settings::load`]).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("RAW_COMPANY_DATA") {
            self.raw_company_data = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CRS") {
            self.crs = v;
        }
        if let Some(v) = get("ACT") {
            self.columns.id = v;
        }
        if let Some(v) = get("NAME") {
            self.columns.name = v;
        }
        if let Some(v) = get("DESC") {
            self.columns.description = v;
        }
        if let Some(v) = get("CITY_FILE") {
            self.overlays.city = Some(PathBuf::from(v));
        }
        if let Some(v) = get("NEIGH_FILE") {
            self.overlays.neighborhoods = Some(PathBuf::from(v));
        }
        if let Some(v) = get("COM_AREAS_FILE") {
            self.overlays.com_areas = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CACHE_CAPACITY") {
            self.cache_capacity = v.trim().parse().map_err(|_| BizmapError::Config {
                message: format!("CACHE_CAPACITY '{}' is not a number", v),
            })?;
        }
        Ok(())
    }

    /// Output CRS parsed from [`Settings::crs`].
    pub fn output_crs(&self) -> Result<Crs> {
        self.crs.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.output_crs()?;
        if self.cache_capacity == 0 {
            return Err(BizmapError::Config {
                message: "cache_capacity must be at least 1".to_string(),
            });
        }
        if self.clustering.min_samples == 0 {
            return Err(BizmapError::Config {
                message: "clustering.min_samples must be at least 1".to_string(),
            });
        }
        if !(2..=6).contains(&self.taxonomy.digits) {
            return Err(BizmapError::Config {
                message: format!("taxonomy.digits {} is not in 2..=6", self.taxonomy.digits),
            });
        }
        self.consolidation.validate()
    }
}
