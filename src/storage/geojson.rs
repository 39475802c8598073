//! GeoJSON readers and writers for point records.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::crs::Crs;
use crate::density::ClusterColumn;
use crate::error::{BizmapError, Result};
use crate::records::{GeoRecordCollection, RawActivityRecord};

/// Property names of the raw license data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            id: "business_activity_id".to_string(),
            name: "doing_business_as_name".to_string(),
            description: "business_activity".to_string(),
        }
    }
}

impl ColumnNames {
    /// Property names used in served feature collections.
    pub fn served() -> Self {
        Self {
            id: "id".to_string(),
            name: "name".to_string(),
            description: "description".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionIn {
    #[serde(default)]
    features: Vec<FeatureIn>,
}

#[derive(Debug, Deserialize)]
struct FeatureIn {
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    geometry: Option<GeometryIn>,
}

#[derive(Debug, Deserialize)]
struct GeometryIn {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

impl GeometryIn {
    fn point(&self) -> Option<(f64, f64)> {
        if self.kind != "Point" {
            return None;
        }
        let coords = self.coordinates.as_array()?;
        Some((coords.first()?.as_f64()?, coords.get(1)?.as_f64()?))
    }
}

fn property_string(properties: &Map<String, Value>, key: &str) -> Option<String> {
    match properties.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse point features. Features without a usable point are dropped.
pub fn parse_feature_collection(text: &str, columns: &ColumnNames, crs: Crs) -> Result<GeoRecordCollection> {
    let input: FeatureCollectionIn = serde_json::from_str(text).map_err(BizmapError::serialization)?;
    let total = input.features.len();
    let empty = Map::new();

    let records: Vec<RawActivityRecord> = input
        .features
        .into_iter()
        .enumerate()
        .filter_map(|(idx, feature)| {
            let (x, y) = feature.geometry.as_ref().and_then(GeometryIn::point)?;
            let properties = feature.properties.as_ref().unwrap_or(&empty);
            let record = RawActivityRecord::new(
                property_string(properties, &columns.id).unwrap_or_else(|| idx.to_string()),
                property_string(properties, &columns.description),
                property_string(properties, &columns.name).unwrap_or_default(),
                x,
                y,
            );
            let record = match property_string(properties, "category") {
                Some(category) => record.with_category(category, property_string(properties, "code")),
                None => record,
            };
            Some(record).filter(RawActivityRecord::has_valid_geometry)
        })
        .collect();

    if records.len() < total {
        log::warn!(
            "[Store] Dropped {} of {} features without a point geometry",
            total - records.len(),
            total
        );
    }
    Ok(GeoRecordCollection::new(crs, records))
}

/// Read raw license records from a GeoJSON file.
pub fn read_raw_geojson(path: &Path, columns: &ColumnNames, crs: Crs) -> Result<GeoRecordCollection> {
    let text = fs::read_to_string(path).map_err(|e| BizmapError::io(path, e))?;
    let collection = parse_feature_collection(&text, columns, crs)?;
    log::info!("[Store] Read {} records from {}", collection.len(), path.display());
    Ok(collection)
}

/// Serialize records as a FeatureCollection in `output_crs`.
///
/// Properties are `name`, `id`, `description`, `category` and, when labels
/// were assigned, `cluster`. A failed clustering is reported in a top-level
/// `clustering` member.
pub fn to_feature_collection(collection: &GeoRecordCollection, clusters: &ClusterColumn, output_crs: Crs) -> Value {
    let projected = collection.reproject(output_crs);
    let labels = clusters.labels();

    let features: Vec<Value> = projected
        .records()
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let mut properties = Map::new();
            properties.insert("name".to_string(), json!(record.name));
            properties.insert("id".to_string(), json!(record.id));
            properties.insert("description".to_string(), json!(record.description));
            properties.insert("category".to_string(), json!(record.category));
            if let Some(code) = &record.code {
                properties.insert("code".to_string(), json!(code));
            }
            if let Some(label) = labels.and_then(|l| l.get(i)) {
                properties.insert("cluster".to_string(), json!(label));
            }
            json!({
                "type": "Feature",
                "id": i.to_string(),
                "properties": properties,
                "geometry": {
                    "type": "Point",
                    "coordinates": [record.geometry.x(), record.geometry.y()],
                },
            })
        })
        .collect();

    let mut output = json!({
        "type": "FeatureCollection",
        "features": features,
    });
    if output_crs != Crs::Wgs84 {
        output["crs"] = json!({
            "type": "name",
            "properties": { "name": format!("urn:ogc:def:crs:EPSG::{}", output_crs.epsg()) },
        });
    }
    if let ClusterColumn::Failed { reason } = clusters {
        output["clustering"] = json!({ "status": "failed", "reason": reason });
    }
    output
}

pub fn write_geometry_collection(
    path: &Path,
    collection: &GeoRecordCollection,
    clusters: &ClusterColumn,
    output_crs: Crs,
) -> Result<()> {
    let value = to_feature_collection(collection, clusters, output_crs);
    let text = serde_json::to_string(&value).map_err(BizmapError::serialization)?;
    fs::write(path, text).map_err(|e| BizmapError::io(path, e))
}

/// Read a collection written by [`write_geometry_collection`].
pub fn read_geometry_collection(path: &Path, crs: Crs) -> Result<GeoRecordCollection> {
    let text = fs::read_to_string(path).map_err(|e| BizmapError::io(path, e))?;
    parse_feature_collection(&text, &ColumnNames::served(), crs)
}
