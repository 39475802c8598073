//! Boundary layers drawn under the points (city, neighborhoods, community areas).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BizmapError, Result};

/// A named overlay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayLayer {
    City,
    Neighborhoods,
    #[serde(rename = "com_areas")]
    CommunityAreas,
}

impl OverlayLayer {
    pub const ALL: [OverlayLayer; 3] = [OverlayLayer::City, OverlayLayer::Neighborhoods, OverlayLayer::CommunityAreas];

    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayLayer::City => "city",
            OverlayLayer::Neighborhoods => "neighborhoods",
            OverlayLayer::CommunityAreas => "com_areas",
        }
    }
}

impl fmt::Display for OverlayLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayLayer {
    type Err = BizmapError;

    fn from_str(s: &str) -> Result<Self> {
        OverlayLayer::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| BizmapError::invalid("overlay", format!("unknown layer '{}'", s)))
    }
}

/// Paths of the overlay source files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayPaths {
    pub city: Option<PathBuf>,
    pub neighborhoods: Option<PathBuf>,
    pub com_areas: Option<PathBuf>,
}

impl OverlayPaths {
    pub fn path(&self, layer: OverlayLayer) -> Option<&Path> {
        match layer {
            OverlayLayer::City => self.city.as_deref(),
            OverlayLayer::Neighborhoods => self.neighborhoods.as_deref(),
            OverlayLayer::CommunityAreas => self.com_areas.as_deref(),
        }
    }
}

/// Loaded overlay layers as GeoJSON FeatureCollections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub city: Option<Value>,
    pub neighborhoods: Option<Value>,
    pub community_areas: Option<Value>,
}

impl Overlay {
    /// Load the requested layers. A requested layer without a configured
    /// path is a configuration error.
    pub fn load(paths: &OverlayPaths, layers: &[OverlayLayer]) -> Result<Self> {
        let mut overlay = Overlay::default();
        for &layer in layers {
            let path = paths.path(layer).ok_or_else(|| BizmapError::Config {
                message: format!("no file configured for overlay '{}'", layer),
            })?;
            let value = read_layer(path)?;
            match layer {
                OverlayLayer::City => overlay.city = Some(value),
                OverlayLayer::Neighborhoods => overlay.neighborhoods = Some(value),
                OverlayLayer::CommunityAreas => overlay.community_areas = Some(value),
            }
        }
        Ok(overlay)
    }

    /// Parse layer names such as `["city", "com_areas"]` and load them.
    pub fn load_named<S: AsRef<str>>(paths: &OverlayPaths, names: &[S]) -> Result<Self> {
        let layers = names
            .iter()
            .map(|n| n.as_ref().parse::<OverlayLayer>())
            .collect::<Result<Vec<_>>>()?;
        Self::load(paths, &layers)
    }

    pub fn layer(&self, layer: OverlayLayer) -> Option<&Value> {
        match layer {
            OverlayLayer::City => self.city.as_ref(),
            OverlayLayer::Neighborhoods => self.neighborhoods.as_ref(),
            OverlayLayer::CommunityAreas => self.community_areas.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        OverlayLayer::ALL.iter().all(|&l| self.layer(l).is_none())
    }
}

fn read_layer(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).map_err(|e| BizmapError::io(path, e))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| BizmapError::serialization(format!("{}: {}", path.display(), e)))?;
    if value.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(BizmapError::serialization(format!(
            "{} is not a GeoJSON FeatureCollection",
            path.display()
        )));
    }
    Ok(value)
}
