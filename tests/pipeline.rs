//! End-to-end tests: raw GeoJSON -> consolidation -> partition store -> query engine.
//!
//! Run with: `cargo test --test pipeline`

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use bizmap::consolidation::ConsolidationStrategy;
use bizmap::crs::utm_to_geographic;
use bizmap::{
    run_batch, BizmapError, Crs, EngineConfig, GeoRecordCollection, LeanPoint, MasterCollection, PartitionStore,
    QueryEngine, QueryResponse, RawActivityRecord, Result, Settings, TextEmbedder, UNCLASSIFIED,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Fixed vectors per label so merges are predictable.
struct TableEmbedder {
    table: HashMap<&'static str, Vec<f32>>,
}

impl TableEmbedder {
    fn new() -> Self {
        let table = [
            ("Tavern", vec![1.0, 0.0, 0.0]),
            ("Taverns", vec![1.0, 0.0, 0.0]),
            ("Grocery Store", vec![0.0, 1.0, 0.0]),
            ("Grocery Stores", vec![0.0, 1.0, 0.0]),
            ("Barber Shop", vec![0.0, 0.0, 1.0]),
            ("Drinking Places", vec![1.0, 0.0, 0.0]),
        ]
        .into_iter()
        .collect();
        Self { table }
    }
}

impl TextEmbedder for TableEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| {
                self.table
                    .get(t.as_str())
                    .cloned()
                    .ok_or_else(|| BizmapError::EmbeddingFailed {
                        message: format!("no vector for '{}'", t),
                    })
            })
            .collect()
    }

    fn dimension(&self) -> usize {
        3
    }
}

fn feature(id: &str, activity: Option<&str>, name: &str, lon: f64, lat: f64) -> Value {
    json!({
        "type": "Feature",
        "properties": {
            "business_activity_id": id,
            "doing_business_as_name": name,
            "business_activity": activity,
        },
        "geometry": { "type": "Point", "coordinates": [lon, lat] },
    })
}

fn write_raw(dir: &Path) -> std::path::PathBuf {
    let features = vec![
        feature("1", Some("Tavern"), "Old Town Ale", -87.6400, 41.9100),
        feature("2", Some("Taverns"), "Rainbo Club", -87.6780, 41.9010),
        feature("3", Some("Grocery Stores"), "Corner Market", -87.6300, 41.8800),
        feature("4", Some("Tavern"), "Green Mill", -87.6600, 41.9690),
        feature("5", Some("Grocery Store"), "Fresh Farms", -87.7000, 41.9900),
        feature("6", Some("Barber Shop"), "Clean Cuts", -87.6200, 41.8500),
        feature("7", Some("Grocery Stores"), "Dom's", -87.6450, 41.9130),
        feature("8", Some("Tavern"), "Hideout", -87.6620, 41.9140),
        feature("9", None, "No Activity Inc", -87.6000, 41.8000),
    ];
    let raw = json!({ "type": "FeatureCollection", "features": features });
    let path = dir.join("licenses.geojson");
    fs::write(&path, raw.to_string()).unwrap();
    path
}

fn settings_for(tmp: &TempDir) -> Settings {
    let raw = write_raw(tmp.path());
    Settings {
        data_dir: tmp.path().join("processed"),
        raw_company_data: Some(raw),
        ..Settings::default()
    }
}

fn feature_ids(response: &QueryResponse) -> Vec<String> {
    let value: Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
    value["features"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["properties"]["id"].as_str().unwrap().to_string())
        .collect()
}

// ============================================================================
// Batch pipeline
// ============================================================================

#[test]
fn test_batch_then_query() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_for(&tmp);

    let report = run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();
    assert_eq!(report.records_read, 9);
    assert_eq!(report.records_written, 9);
    assert_eq!(report.raw_labels, 5);
    assert_eq!(report.canonical_labels, 4);

    let engine = QueryEngine::from_settings(&settings).unwrap();
    assert_eq!(
        engine.list_canonical_labels(),
        vec![
            "Barber Shop".to_string(),
            "Grocery Stores".to_string(),
            "Tavern".to_string(),
            UNCLASSIFIED.to_string()
        ]
    );

    let response = engine.filter_and_cluster(&["Tavern"], false, 0.0, 0).unwrap();
    assert_eq!(response.status_code(), 200);
    let value: Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
    let features = value["features"].as_array().unwrap();
    assert_eq!(features.len(), 4);
    let descriptions: BTreeSet<&str> = features
        .iter()
        .map(|f| f["properties"]["description"].as_str().unwrap())
        .collect();
    assert_eq!(descriptions, BTreeSet::from(["Tavern", "Taverns"]));
    assert!(features
        .iter()
        .all(|f| f["properties"]["category"] == "Tavern" && f["properties"].get("cluster").is_none()));
    assert!(value.get("crs").is_none());
}

#[test]
fn test_mapping_index_matches_partitions() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_for(&tmp);
    run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();

    let store = PartitionStore::open(&settings.data_dir);
    let mapping = store.read_mapping().unwrap();
    assert_eq!(mapping.len(), 5);
    assert_eq!(mapping.get("Taverns"), Some("Tavern"));
    assert_eq!(mapping.get("Grocery Store"), Some("Grocery Stores"));

    // Every canonical label of the index has its partition
    for label in mapping.canonical_labels() {
        let partition = store.read_partition(&label).unwrap();
        assert!(!partition.is_empty(), "empty partition for {}", label);
        assert!(partition.records().iter().all(|r| r.category.as_deref() == Some(label.as_str())));
    }
    // and every partition outside the unmapped bucket is indexed
    let master = store.load_master().unwrap();
    let indexed: BTreeSet<String> = mapping.canonical_labels().into_iter().collect();
    for category in master.categories() {
        assert!(category == UNCLASSIFIED || indexed.contains(&category), "orphan {}", category);
    }
    assert_eq!(master.len(), 9);

    assert!(matches!(
        store.read_partition("Laundromat"),
        Err(BizmapError::MissingData { .. })
    ));
}

#[test]
fn test_rerun_replaces_previous_batch() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings_for(&tmp);
    run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();

    settings.consolidation.unmapped = bizmap::UnmappedPolicy::Drop;
    let report = run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();
    assert_eq!(report.records_dropped, 1);

    let master = PartitionStore::open(&settings.data_dir).load_master().unwrap();
    assert_eq!(master.len(), 8);
    assert!(!master.contains_category(UNCLASSIFIED));

    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".processed"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_failed_embedding_keeps_previous_store() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_for(&tmp);
    run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();

    let mut broken = TableEmbedder::new();
    broken.table.remove("Barber Shop");
    let err = run_batch(&settings, Arc::new(broken)).unwrap_err();
    assert!(matches!(err, BizmapError::EmbeddingFailed { .. }));

    let master = PartitionStore::open(&settings.data_dir).load_master().unwrap();
    assert_eq!(master.len(), 9);
}

#[test]
fn test_taxonomy_matching_batch() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings_for(&tmp);
    let titles = tmp.path().join("titles.csv");
    fs::write(
        &titles,
        "industry_title\nNAICS07 7224 Drinking Places\nNAICS07 4451 Grocery Stores\nNAICS07 44 Retail Trade\n",
    )
    .unwrap();
    settings.consolidation.strategy = ConsolidationStrategy::TaxonomyMatching;
    settings.taxonomy.file = Some(titles);

    run_batch(&settings, Arc::new(TableEmbedder::new())).unwrap();

    let store = PartitionStore::open(&settings.data_dir);
    let mapping = store.read_mapping().unwrap();
    assert_eq!(mapping.get("Tavern"), Some("Drinking Places"));
    assert_eq!(mapping.get("Taverns"), Some("Drinking Places"));
    assert_eq!(mapping.get("Grocery Store"), Some("Grocery Stores"));
    assert_eq!(mapping.get("Barber Shop"), Some(UNCLASSIFIED));
    assert_eq!(mapping.code_for("Drinking Places"), Some("7224"));
    assert_eq!(mapping.code_for("Grocery Stores"), Some("4451"));

    let drinking = store.read_partition("Drinking Places").unwrap();
    assert_eq!(drinking.len(), 4);
    assert!(drinking.records().iter().all(|r| r.code.as_deref() == Some("7224")));
}

// ============================================================================
// Query engine
// ============================================================================

fn pair_engine(capacity: usize) -> QueryEngine {
    let (lon_a, lat_a) = utm_to_geographic(16, true, 447_742.0, 4_636_434.0);
    let (lon_b, lat_b) = utm_to_geographic(16, true, 448_742.0, 4_636_434.0);
    let mut records = vec![
        RawActivityRecord::new("a", Some("pub".into()), "A", lon_a, lat_a).with_category("Pair", None),
        RawActivityRecord::new("b", Some("pub".into()), "B", lon_b, lat_b).with_category("Pair", None),
    ];
    for (i, label) in ["One", "Two", "Three"].iter().enumerate() {
        records.push(
            RawActivityRecord::new(format!("x{}", i), None, *label, -87.6 + i as f64 * 0.01, 41.9)
                .with_category(*label, None),
        );
    }
    let master = MasterCollection::new(GeoRecordCollection::new(Crs::Wgs84, records));
    QueryEngine::new(
        Arc::new(master),
        EngineConfig {
            cache_capacity: capacity,
            ..EngineConfig::default()
        },
    )
}

fn cluster_labels(response: &QueryResponse) -> Vec<i64> {
    let value: Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
    value["features"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["properties"]["cluster"].as_i64().unwrap())
        .collect()
}

#[test]
fn test_epsilon_in_meters_through_engine() {
    let engine = pair_engine(8);
    let merged = engine.filter_and_cluster(&["Pair"], true, 1001.0, 2).unwrap();
    assert_eq!(cluster_labels(&merged), vec![0, 0]);
    let apart = engine.filter_and_cluster(&["Pair"], true, 999.0, 2).unwrap();
    assert_eq!(cluster_labels(&apart), vec![-1, -1]);
    assert_eq!(engine.stats().computations, 2);
}

#[test]
fn test_repeated_query_is_cached() {
    let engine = pair_engine(8);
    let first = engine.filter_and_cluster(&["Two", "One"], false, 0.0, 0).unwrap();
    let second = engine.filter_and_cluster(&["One", "Two", "One"], false, 3.0, 7).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(feature_ids(&first), vec!["x0".to_string(), "x1".to_string()]);

    let stats = engine.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cached_entries, 1);
}

#[test]
fn test_cache_evicts_least_recent() {
    let engine = pair_engine(2);
    engine.filter_and_cluster(&["One"], false, 0.0, 0).unwrap();
    engine.filter_and_cluster(&["Two"], false, 0.0, 0).unwrap();
    // Touch "One" so "Two" is the oldest
    engine.filter_and_cluster(&["One"], false, 0.0, 0).unwrap();
    engine.filter_and_cluster(&["Three"], false, 0.0, 0).unwrap();
    assert_eq!(engine.stats().cached_entries, 2);
    assert_eq!(engine.stats().computations, 3);

    engine.filter_and_cluster(&["One"], false, 0.0, 0).unwrap();
    assert_eq!(engine.stats().computations, 3);
    engine.filter_and_cluster(&["Two"], false, 0.0, 0).unwrap();
    assert_eq!(engine.stats().computations, 4);
}

#[test]
fn test_empty_and_unknown_requests() {
    let engine = pair_engine(4);
    let none: [&str; 0] = [];
    let empty = engine.filter_and_cluster(&none, false, 0.0, 0).unwrap();
    assert_eq!(empty.status_code(), 204);
    assert_eq!(engine.stats().cached_entries, 0);

    let unknown = engine.filter_and_cluster(&["Nowhere"], true, 10.0, 2).unwrap();
    assert_eq!(unknown.status_code(), 204);

    let partly = engine.filter_and_cluster(&["Nowhere", "Three"], false, 0.0, 0).unwrap();
    assert_eq!(feature_ids(&partly), vec!["x2".to_string()]);
}

#[test]
fn test_concurrent_identical_queries_compute_once() {
    let engine = Arc::new(pair_engine(4));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.filter_and_cluster(&["Pair"], true, 1001.0, 2).unwrap())
        })
        .collect();
    let responses: Vec<Arc<QueryResponse>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(responses.iter().all(|r| Arc::ptr_eq(r, &responses[0])));
    let stats = engine.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.cache_hits, 7);
}

#[test]
fn test_lean_points_are_lat_lon() {
    let engine = pair_engine(4);
    let points = engine.get_lean_points(&["Two"]);
    assert_eq!(points.len(), 1);
    let LeanPoint(lat, lon, name) = &points[0];
    assert!((lat - 41.9).abs() < 1e-9);
    assert!((lon - -87.59).abs() < 1e-9);
    assert_eq!(name, "Two");
}

#[test]
fn test_projected_output_crs() {
    let records = vec![RawActivityRecord::new("1", None, "A", -87.64, 41.91).with_category("Bars", None)];
    let master = MasterCollection::new(GeoRecordCollection::new(Crs::Wgs84, records));
    let engine = QueryEngine::new(
        Arc::new(master),
        EngineConfig {
            output_crs: Crs::Utm {
                zone: 16,
                north: true,
            },
            ..EngineConfig::default()
        },
    );
    let response = engine.filter_and_cluster(&["Bars"], false, 0.0, 0).unwrap();
    let value: Value = serde_json::from_str(response.as_json().unwrap()).unwrap();
    assert_eq!(value["crs"]["properties"]["name"], "urn:ogc:def:crs:EPSG::32616");
    let easting = value["features"][0]["geometry"]["coordinates"][0].as_f64().unwrap();
    assert!(easting > 100_000.0 && easting < 900_000.0);
}
