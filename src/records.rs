//! Point records and CRS-tagged collections.

use std::collections::HashMap;

use geo::Point;
use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::error::{BizmapError, Result};

/// Catch-all label for descriptions that have no canonical mapping.
pub const UNCLASSIFIED: &str = "Unclassified";

/// A business-license record with its point location.
///
/// Geometry is always present; records without a location are dropped when
/// the raw data is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawActivityRecord {
    /// Business activity identifier from the source data
    pub id: String,
    /// Free-text activity description, if the source had one
    pub description: Option<String>,
    /// Display name ("doing business as")
    pub name: String,
    /// Point location, `x` = longitude / easting, `y` = latitude / northing
    pub geometry: Point<f64>,
    /// Canonical label assigned by consolidation
    #[serde(default)]
    pub category: Option<String>,
    /// Taxonomy code of the canonical label, when taxonomy matching ran
    #[serde(default)]
    pub code: Option<String>,
}

impl RawActivityRecord {
    pub fn new(id: impl Into<String>, description: Option<String>, name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            description,
            name: name.into(),
            geometry: Point::new(x, y),
            category: None,
            code: None,
        }
    }

    /// Attach a canonical label (and optional code).
    pub fn with_category(mut self, category: impl Into<String>, code: Option<String>) -> Self {
        self.category = Some(category.into());
        self.code = code;
        self
    }

    /// Check if the geometry has finite coordinates.
    pub fn has_valid_geometry(&self) -> bool {
        self.geometry.x().is_finite() && self.geometry.y().is_finite()
    }
}

/// Ordered records sharing one declared CRS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecordCollection {
    crs: Crs,
    records: Vec<RawActivityRecord>,
}

impl GeoRecordCollection {
    pub fn new(crs: Crs, records: Vec<RawActivityRecord>) -> Self {
        Self { crs, records }
    }

    pub fn empty(crs: Crs) -> Self {
        Self::new(crs, Vec::new())
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn records(&self) -> &[RawActivityRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RawActivityRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append records from another collection.
    ///
    /// Fails when the CRS tags differ; callers must reproject first.
    pub fn extend_from(&mut self, other: GeoRecordCollection) -> Result<()> {
        if other.crs != self.crs {
            return Err(BizmapError::invalid(
                "crs",
                format!("cannot mix {} records into a {} collection", other.crs, self.crs),
            ));
        }
        self.records.extend(other.records);
        Ok(())
    }

    /// Return a copy of this collection in `target`, preserving record order.
    pub fn reproject(&self, target: Crs) -> GeoRecordCollection {
        if target == self.crs {
            return self.clone();
        }
        let records = self
            .records
            .iter()
            .map(|r| {
                let (x, y) = self.crs.transform(&target, r.geometry.x(), r.geometry.y());
                RawActivityRecord {
                    geometry: Point::new(x, y),
                    ..r.clone()
                }
            })
            .collect();
        GeoRecordCollection::new(target, records)
    }

    /// Mean position of all records, in this collection's CRS.
    pub fn mean_position(&self) -> Option<(f64, f64)> {
        if self.records.is_empty() {
            return None;
        }
        let n = self.records.len() as f64;
        let (sx, sy) = self
            .records
            .iter()
            .fold((0.0, 0.0), |(sx, sy), r| (sx + r.geometry.x(), sy + r.geometry.y()));
        Some((sx / n, sy / n))
    }
}

/// The full consolidated dataset, indexed by canonical label.
///
/// Loaded once and never mutated; queries filter copies out of it.
#[derive(Debug, Clone)]
pub struct MasterCollection {
    collection: GeoRecordCollection,
    by_category: HashMap<String, Vec<usize>>,
}

impl MasterCollection {
    /// Index `collection` by record category. Records without a category
    /// are only reachable through [`MasterCollection::collection`].
    pub fn new(collection: GeoRecordCollection) -> Self {
        let mut by_category: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, record) in collection.records().iter().enumerate() {
            if let Some(category) = &record.category {
                by_category.entry(category.clone()).or_default().push(idx);
            }
        }
        Self {
            collection,
            by_category,
        }
    }

    pub fn collection(&self) -> &GeoRecordCollection {
        &self.collection
    }

    pub fn crs(&self) -> Crs {
        self.collection.crs()
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.by_category.keys().cloned().collect();
        categories.sort();
        categories
    }

    pub fn contains_category(&self, category: &str) -> bool {
        self.by_category.contains_key(category)
    }

    /// Records in any of `categories`, in master order.
    pub fn filter<S: AsRef<str>>(&self, categories: &[S]) -> GeoRecordCollection {
        let mut indices: Vec<usize> = categories
            .iter()
            .filter_map(|c| self.by_category.get(c.as_ref()))
            .flatten()
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        let records = indices
            .into_iter()
            .map(|i| self.collection.records[i].clone())
            .collect();
        GeoRecordCollection::new(self.collection.crs(), records)
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}
