//! Batch pipeline: raw records to consolidated partitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::Settings;
use crate::consolidation::{
    ConsolidationStrategy, LabelConsolidator, LabelFrequencies, LabelMapping, Taxonomy, UnmappedPolicy,
};
use crate::crs::Crs;
use crate::embedding::TextEmbedder;
use crate::error::{BizmapError, Result};
use crate::records::{GeoRecordCollection, RawActivityRecord};
use crate::storage::geojson::read_raw_geojson;
use crate::storage::PartitionStore;

/// Summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub records_read: usize,
    pub records_written: usize,
    pub records_dropped: usize,
    pub raw_labels: usize,
    pub canonical_labels: usize,
}

/// Records grouped by canonical label, plus the mapping that produced them.
#[derive(Debug, Clone)]
pub struct ConsolidatedRecords {
    pub partitions: BTreeMap<String, GeoRecordCollection>,
    pub mapping: LabelMapping,
    pub report: IngestReport,
}

/// Consolidate the descriptions of `collection` and tag every record.
///
/// Records whose description does not resolve under `policy` are dropped.
pub fn consolidate_records(
    collection: GeoRecordCollection,
    consolidator: &LabelConsolidator,
    taxonomy: Option<&Taxonomy>,
    policy: UnmappedPolicy,
) -> Result<ConsolidatedRecords> {
    let frequencies = LabelFrequencies::from_records(collection.records());
    let mapping = consolidator.consolidate(&frequencies, taxonomy)?;

    let crs = collection.crs();
    let records_read = collection.len();
    let mut grouped: BTreeMap<String, Vec<RawActivityRecord>> = BTreeMap::new();
    let mut records_dropped = 0;
    for record in collection.into_records() {
        let Some(canonical) = mapping.resolve(record.description.as_deref(), policy) else {
            records_dropped += 1;
            continue;
        };
        let code = mapping.code_for(canonical).map(str::to_string);
        let record = record.with_category(canonical, code);
        grouped.entry(canonical.to_string()).or_default().push(record);
    }
    let partitions: BTreeMap<String, GeoRecordCollection> = grouped
        .into_iter()
        .map(|(label, records)| (label, GeoRecordCollection::new(crs, records)))
        .collect();

    if records_dropped > 0 {
        log::warn!("[Consolidator] Dropped {} records without a canonical label", records_dropped);
    }
    let report = IngestReport {
        records_read,
        records_written: records_read - records_dropped,
        records_dropped,
        raw_labels: frequencies.len(),
        canonical_labels: partitions.len(),
    };
    Ok(ConsolidatedRecords {
        partitions,
        mapping,
        report,
    })
}

/// Read the raw data, consolidate it and replace the partition store.
///
/// Nothing is written unless every step succeeds.
pub fn run_batch(settings: &Settings, embedder: Arc<dyn TextEmbedder>) -> Result<IngestReport> {
    let raw_path = settings.raw_company_data.as_deref().ok_or_else(|| BizmapError::Config {
        message: "raw_company_data (RAW_COMPANY_DATA) is not set".to_string(),
    })?;

    let taxonomy = match settings.consolidation.strategy {
        ConsolidationStrategy::TaxonomyMatching => {
            let file = settings.taxonomy.file.as_deref().ok_or_else(|| BizmapError::Config {
                message: "taxonomy matching needs taxonomy.file".to_string(),
            })?;
            Some(Taxonomy::from_titles_csv(file, settings.taxonomy.digits)?)
        }
        ConsolidationStrategy::SelfClustering => None,
    };

    // GeoJSON coordinates are WGS84 longitude/latitude
    let collection = read_raw_geojson(raw_path, &settings.columns, Crs::Wgs84)?;
    let consolidator = LabelConsolidator::new(settings.consolidation.clone(), embedder)?;
    let consolidated = consolidate_records(
        collection,
        &consolidator,
        taxonomy.as_ref(),
        settings.consolidation.unmapped,
    )?;

    PartitionStore::open(&settings.data_dir).write_batch(&consolidated.partitions, &consolidated.mapping)?;
    log::info!(
        "[Consolidator] Reduced {} raw categories to {} canonical categories over {} records",
        consolidated.report.raw_labels,
        consolidated.report.canonical_labels,
        consolidated.report.records_written
    );
    Ok(consolidated.report)
}
