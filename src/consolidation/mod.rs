//! # Label Consolidation
//!
//! Collapses free-text business-activity descriptions into a bounded set of
//! canonical labels.
//!
//! Two strategies are available:
//! - **SelfClustering**: embed the raw labels, cluster them agglomeratively
//!   under a distance threshold and pick one representative per group.
//! - **TaxonomyMatching**: snap each raw label to its most similar taxonomy
//!   description (or `"Unclassified"` below the similarity floor), then run
//!   the self-clustering pass over the matched descriptions to merge
//!   near-duplicates.
//!
//! The result is a [`LabelMapping`] from every raw label seen to its
//! canonical label, plus taxonomy codes when a taxonomy was used.

pub mod agglomerative;
pub mod representative;
pub mod taxonomy;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::{embed_checked, normalize, TextEmbedder};
use crate::error::{BizmapError, Result};
use crate::records::{RawActivityRecord, UNCLASSIFIED};

pub use agglomerative::{cluster_with_threshold, Linkage};
pub use representative::{select_representative, RepresentativePolicy};
pub use taxonomy::{match_to_taxonomy, Taxonomy, TaxonomyEntry};

// ============================================================================
// Configuration
// ============================================================================

/// Which consolidation pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStrategy {
    #[default]
    SelfClustering,
    TaxonomyMatching,
}

impl std::str::FromStr for ConsolidationStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "self_clustering" | "self" => Ok(ConsolidationStrategy::SelfClustering),
            "taxonomy_matching" | "taxonomy" => Ok(ConsolidationStrategy::TaxonomyMatching),
            other => Err(format!("unknown consolidation strategy '{}'", other)),
        }
    }
}

/// What happens to records whose description has no canonical label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    /// Route them to the `"Unclassified"` catch-all category.
    #[default]
    Bucket,
    /// Leave them out.
    Drop,
}

impl std::str::FromStr for UnmappedPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bucket" => Ok(UnmappedPolicy::Bucket),
            "drop" => Ok(UnmappedPolicy::Drop),
            other => Err(format!("unknown unmapped policy '{}'", other)),
        }
    }
}

/// Consolidation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub strategy: ConsolidationStrategy,
    /// Groups merge while their linkage distance is strictly below this.
    pub distance_threshold: f64,
    pub linkage: Linkage,
    /// Scale embeddings to unit length before clustering.
    pub normalize: bool,
    pub representative: RepresentativePolicy,
    /// Minimum cosine similarity (exclusive) for a taxonomy match.
    pub similarity_floor: f32,
    pub unmapped: UnmappedPolicy,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            strategy: ConsolidationStrategy::SelfClustering,
            distance_threshold: 0.5,
            linkage: Linkage::Ward,
            normalize: true,
            representative: RepresentativePolicy::Frequency,
            similarity_floor: 0.4,
            unmapped: UnmappedPolicy::Bucket,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.distance_threshold.is_finite() || self.distance_threshold < 0.0 {
            return Err(BizmapError::invalid(
                "distance_threshold",
                format!("{} is not a non-negative distance", self.distance_threshold),
            ));
        }
        if !(-1.0..=1.0).contains(&self.similarity_floor) {
            return Err(BizmapError::invalid(
                "similarity_floor",
                format!("{} is outside [-1, 1]", self.similarity_floor),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Label frequencies
// ============================================================================

/// Distinct raw labels in first-seen order with their occurrence counts.
#[derive(Debug, Clone, Default)]
pub struct LabelFrequencies {
    labels: Vec<String>,
    counts: Vec<u64>,
    index: HashMap<String, usize>,
}

impl LabelFrequencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count descriptions of the given records; records without one are skipped.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a RawActivityRecord>,
    {
        let mut freq = Self::new();
        for record in records {
            if let Some(description) = record.description.as_deref() {
                freq.add_count(description, 1);
            }
        }
        freq
    }

    pub fn add(&mut self, label: &str) {
        self.add_count(label, 1);
    }

    pub fn add_count(&mut self, label: &str, count: u64) {
        match self.index.get(label) {
            Some(&idx) => self.counts[idx] += count,
            None => {
                self.index.insert(label.to_string(), self.labels.len());
                self.labels.push(label.to_string());
                self.counts.push(count);
            }
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn count(&self, label: &str) -> u64 {
        self.index.get(label).map(|&i| self.counts[i]).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for LabelFrequencies {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        let mut freq = Self::new();
        iter.into_iter().for_each(|label| freq.add(label));
        freq
    }
}

// ============================================================================
// Label mapping
// ============================================================================

/// One row of the persisted mapping index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRow {
    pub raw_activity: String,
    pub clean_activity: String,
    #[serde(default, alias = "naics_code")]
    pub code: Option<String>,
}

/// Total function from raw description to canonical label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMapping {
    canonical: HashMap<String, String>,
    codes: HashMap<String, String>,
}

impl LabelMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `raw` to `canonical`, replacing any previous mapping.
    pub fn insert(&mut self, raw: impl Into<String>, canonical: impl Into<String>) {
        self.canonical.insert(raw.into(), canonical.into());
    }

    /// Record the taxonomy code of a canonical label.
    pub fn set_code(&mut self, canonical: impl Into<String>, code: impl Into<String>) {
        self.codes.insert(canonical.into(), code.into());
    }

    /// Canonical label of a raw description seen during consolidation.
    pub fn get(&self, raw: &str) -> Option<&str> {
        self.canonical.get(raw).map(String::as_str)
    }

    /// Canonical label for a description under `policy`.
    ///
    /// Missing or unseen descriptions become `"Unclassified"` with
    /// [`UnmappedPolicy::Bucket`] and `None` with [`UnmappedPolicy::Drop`].
    pub fn resolve(&self, raw: Option<&str>, policy: UnmappedPolicy) -> Option<&str> {
        match (raw.and_then(|r| self.get(r)), policy) {
            (Some(canonical), _) => Some(canonical),
            (None, UnmappedPolicy::Bucket) => Some(UNCLASSIFIED),
            (None, UnmappedPolicy::Drop) => None,
        }
    }

    pub fn code_for(&self, canonical: &str) -> Option<&str> {
        self.codes.get(canonical).map(String::as_str)
    }

    /// Distinct canonical labels, sorted.
    pub fn canonical_labels(&self) -> Vec<String> {
        self.canonical
            .values()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Rows sorted by canonical then raw label.
    pub fn to_rows(&self) -> Vec<MappingRow> {
        let mut rows: Vec<MappingRow> = self
            .canonical
            .iter()
            .map(|(raw, canonical)| MappingRow {
                raw_activity: raw.clone(),
                clean_activity: canonical.clone(),
                code: self.codes.get(canonical).cloned(),
            })
            .collect();
        rows.sort_by(|a, b| {
            a.clean_activity
                .cmp(&b.clean_activity)
                .then_with(|| a.raw_activity.cmp(&b.raw_activity))
        });
        rows
    }

    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = MappingRow>,
    {
        let mut mapping = Self::new();
        for row in rows {
            if let Some(code) = row.code.filter(|c| !c.is_empty()) {
                mapping.set_code(row.clean_activity.clone(), code);
            }
            mapping.insert(row.raw_activity, row.clean_activity);
        }
        mapping
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

// ============================================================================
// Consolidator
// ============================================================================

/// Runs label consolidation with a configured embedder.
pub struct LabelConsolidator {
    config: ConsolidationConfig,
    embedder: Arc<dyn TextEmbedder>,
}

impl LabelConsolidator {
    pub fn new(config: ConsolidationConfig, embedder: Arc<dyn TextEmbedder>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, embedder })
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Consolidate `labels` with the configured strategy.
    ///
    /// Embedding failures abort the whole run.
    pub fn consolidate(&self, labels: &LabelFrequencies, taxonomy: Option<&Taxonomy>) -> Result<LabelMapping> {
        let mapping = match self.config.strategy {
            ConsolidationStrategy::SelfClustering => self.self_cluster(labels)?,
            ConsolidationStrategy::TaxonomyMatching => {
                let taxonomy = taxonomy.ok_or_else(|| BizmapError::Config {
                    message: "taxonomy matching needs a taxonomy file".to_string(),
                })?;
                self.match_taxonomy(labels, taxonomy)?
            }
        };
        log::info!(
            "[Consolidator] Reduced {} raw labels to {} canonical labels",
            labels.len(),
            mapping.canonical_labels().len()
        );
        Ok(mapping)
    }

    fn self_cluster(&self, labels: &LabelFrequencies) -> Result<LabelMapping> {
        let reps = self.condense(labels.labels(), labels.counts(), None)?;
        let mut mapping = LabelMapping::new();
        for (raw, rep) in labels.labels().iter().zip(reps) {
            mapping.insert(raw.clone(), labels.labels()[rep].clone());
        }
        Ok(mapping)
    }

    fn match_taxonomy(&self, labels: &LabelFrequencies, taxonomy: &Taxonomy) -> Result<LabelMapping> {
        if taxonomy.is_empty() {
            return Err(BizmapError::Taxonomy {
                message: "taxonomy has no entries".to_string(),
            });
        }
        let mut mapping = LabelMapping::new();
        if labels.is_empty() {
            return Ok(mapping);
        }

        let descriptions = taxonomy.descriptions();
        let corpus = embed_checked(self.embedder.as_ref(), &descriptions)?;
        let queries = embed_checked(self.embedder.as_ref(), labels.labels())?;
        let matches = match_to_taxonomy(&queries, &corpus, self.config.similarity_floor);

        // Distinct matched entries in first-seen order, weighted by raw counts
        let mut matched = LabelFrequencies::new();
        let mut matched_entries: Vec<usize> = Vec::new();
        for (entry, &count) in matches.iter().zip(labels.counts()) {
            if let Some(entry) = *entry {
                let description = &descriptions[entry];
                if matched.count(description) == 0 {
                    matched_entries.push(entry);
                }
                matched.add_count(description, count);
            }
        }
        let unclassified = matches.iter().filter(|m| m.is_none()).count();
        log::info!(
            "[Consolidator] Matched {} raw labels to {} taxonomy entries, {} unclassified",
            labels.len() - unclassified,
            matched.len(),
            unclassified
        );

        let matched_vectors: Vec<Vec<f32>> = matched_entries.iter().map(|&e| corpus[e].clone()).collect();
        let reps = self.condense(matched.labels(), matched.counts(), Some(matched_vectors))?;
        let tightened: HashMap<&str, &str> = matched
            .labels()
            .iter()
            .zip(&reps)
            .map(|(label, &rep)| (label.as_str(), matched.labels()[rep].as_str()))
            .collect();

        for (raw, entry) in labels.labels().iter().zip(&matches) {
            let canonical = entry
                .map(|e| descriptions[e].as_str())
                .and_then(|d| tightened.get(d).copied())
                .unwrap_or(UNCLASSIFIED);
            mapping.insert(raw.clone(), canonical);
            if let Some(code) = taxonomy.code_for(canonical) {
                mapping.set_code(canonical, code);
            }
        }
        Ok(mapping)
    }

    /// Cluster `labels` and return each label's representative index.
    fn condense(&self, labels: &[String], counts: &[u64], embeddings: Option<Vec<Vec<f32>>>) -> Result<Vec<usize>> {
        if labels.len() < 2 {
            return Ok((0..labels.len()).collect());
        }

        let mut embeddings = match embeddings {
            Some(vectors) => vectors,
            None => embed_checked(self.embedder.as_ref(), labels)?,
        };
        if self.config.normalize {
            embeddings.iter_mut().for_each(|v| normalize(v));
        }

        let groups = cluster_with_threshold(&embeddings, self.config.linkage, self.config.distance_threshold);
        let mut reps: Vec<usize> = (0..labels.len()).collect();
        for group in &groups {
            let rep = select_representative(group, self.config.representative, counts, &embeddings)
                .ok_or_else(|| BizmapError::EmbeddingFailed {
                    message: "agglomerative clustering produced an empty group".to_string(),
                })?;
            for &member in group {
                reps[member] = rep;
            }
        }
        log::debug!(
            "[Consolidator] {} labels condensed into {} groups (threshold {})",
            labels.len(),
            groups.len(),
            self.config.distance_threshold
        );
        Ok(reps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds by lookup: each label maps to a fixed 2D vector.
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        calls: AtomicUsize,
    }

    impl TableEmbedder {
        fn new(entries: &[(&str, [f32; 2])]) -> Self {
            Self {
                table: entries.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextEmbedder for TableEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            texts
                .iter()
                .map(|t| {
                    self.table.get(t).cloned().ok_or_else(|| BizmapError::EmbeddingFailed {
                        message: format!("no vector for '{}'", t),
                    })
                })
                .collect()
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn consolidator(config: ConsolidationConfig, embedder: Arc<TableEmbedder>) -> LabelConsolidator {
        LabelConsolidator::new(config, embedder).unwrap()
    }

    #[test]
    fn test_self_clustering_frequency_representative() {
        let embedder = Arc::new(TableEmbedder::new(&[
            ("Retail Food", [1.0, 0.0]),
            ("Retail Food Establishment", [0.99, 0.05]),
            ("Food Retail", [0.98, 0.1]),
            ("Tavern", [0.0, 1.0]),
        ]));
        let mut labels = LabelFrequencies::new();
        labels.add_count("Retail Food", 5);
        labels.add_count("Retail Food Establishment", 12);
        labels.add_count("Food Retail", 3);
        labels.add_count("Tavern", 7);

        let mapping = consolidator(ConsolidationConfig::default(), embedder)
            .consolidate(&labels, None)
            .unwrap();

        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping.get("Retail Food"), Some("Retail Food Establishment"));
        assert_eq!(mapping.get("Food Retail"), Some("Retail Food Establishment"));
        assert_eq!(mapping.get("Tavern"), Some("Tavern"));
        assert_eq!(
            mapping.canonical_labels(),
            vec!["Retail Food Establishment".to_string(), "Tavern".to_string()]
        );
    }

    #[test]
    fn test_tiny_label_sets_skip_embedding() {
        let embedder = Arc::new(TableEmbedder::new(&[]));
        let c = consolidator(ConsolidationConfig::default(), Arc::clone(&embedder));

        assert!(c.consolidate(&LabelFrequencies::new(), None).unwrap().is_empty());
        let one: LabelFrequencies = ["Only Label"].into_iter().collect();
        let mapping = c.consolidate(&one, None).unwrap();
        assert_eq!(mapping.get("Only Label"), Some("Only Label"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_embedding_failure_is_fatal() {
        let embedder = Arc::new(TableEmbedder::new(&[("Known", [1.0, 0.0])]));
        let labels: LabelFrequencies = ["Known", "Unknown"].into_iter().collect();
        let err = consolidator(ConsolidationConfig::default(), embedder)
            .consolidate(&labels, None)
            .unwrap_err();
        assert!(matches!(err, BizmapError::EmbeddingFailed { .. }));
    }

    #[test]
    fn test_taxonomy_matching_with_floor() {
        let embedder = Arc::new(TableEmbedder::new(&[
            ("Grocery Stores", [1.0, 0.0]),
            ("Drinking Places", [0.0, 1.0]),
            ("grocery", [0.9, 0.1]),
            ("bar", [0.1, 0.9]),
            // cosine 0.6 to Grocery Stores
            ("deli", [0.6, -0.8]),
            // cosine 0.3 to Grocery Stores
            ("kiosk", [0.3, -0.953_939_2]),
        ]));
        let taxonomy = Taxonomy::new(vec![
            ("4451".to_string(), "Grocery Stores".to_string()),
            ("7224".to_string(), "Drinking Places".to_string()),
        ]);
        let labels: LabelFrequencies = ["grocery", "bar", "deli", "kiosk"].into_iter().collect();
        let config = ConsolidationConfig {
            strategy: ConsolidationStrategy::TaxonomyMatching,
            ..ConsolidationConfig::default()
        };

        let mapping = consolidator(config, embedder).consolidate(&labels, Some(&taxonomy)).unwrap();
        assert_eq!(mapping.get("grocery"), Some("Grocery Stores"));
        assert_eq!(mapping.get("deli"), Some("Grocery Stores"));
        assert_eq!(mapping.get("bar"), Some("Drinking Places"));
        assert_eq!(mapping.get("kiosk"), Some(UNCLASSIFIED));
        assert_eq!(mapping.code_for("Grocery Stores"), Some("4451"));
        assert_eq!(mapping.code_for(UNCLASSIFIED), None);
    }

    #[test]
    fn test_taxonomy_second_pass_merges_near_entries() {
        let embedder = Arc::new(TableEmbedder::new(&[
            ("Grocery Stores", [1.0, 0.0]),
            ("Supermarkets", [0.98, 0.2]),
            ("Drinking Places", [0.0, 1.0]),
            ("grocery", [1.0, 0.0]),
            ("supermarket", [0.97, 0.25]),
            ("bar", [0.1, 0.9]),
            ("zzz", [0.0, -1.0]),
        ]));
        let taxonomy = Taxonomy::new(vec![
            ("4451".to_string(), "Grocery Stores".to_string()),
            ("4452".to_string(), "Supermarkets".to_string()),
            ("7224".to_string(), "Drinking Places".to_string()),
        ]);
        let mut labels = LabelFrequencies::new();
        labels.add_count("grocery", 2);
        labels.add_count("supermarket", 5);
        labels.add_count("bar", 3);
        labels.add_count("zzz", 1);
        let config = ConsolidationConfig {
            strategy: ConsolidationStrategy::TaxonomyMatching,
            ..ConsolidationConfig::default()
        };

        let mapping = consolidator(config, embedder).consolidate(&labels, Some(&taxonomy)).unwrap();

        // Both entries are 0.2 apart, so the more frequent one absorbs the other
        assert_eq!(mapping.get("grocery"), Some("Supermarkets"));
        assert_eq!(mapping.get("supermarket"), Some("Supermarkets"));
        assert_eq!(mapping.get("bar"), Some("Drinking Places"));
        assert_eq!(mapping.get("zzz"), Some(UNCLASSIFIED));
        assert_eq!(mapping.code_for("Supermarkets"), Some("4452"));
        assert_eq!(mapping.code_for("Drinking Places"), Some("7224"));
        assert_eq!(mapping.code_for(UNCLASSIFIED), None);
        assert_eq!(
            mapping.canonical_labels(),
            vec![
                "Drinking Places".to_string(),
                "Supermarkets".to_string(),
                UNCLASSIFIED.to_string()
            ]
        );
    }

    #[test]
    fn test_taxonomy_strategy_requires_taxonomy() {
        let embedder = Arc::new(TableEmbedder::new(&[]));
        let config = ConsolidationConfig {
            strategy: ConsolidationStrategy::TaxonomyMatching,
            ..ConsolidationConfig::default()
        };
        let labels: LabelFrequencies = ["a"].into_iter().collect();
        let err = consolidator(config, embedder).consolidate(&labels, None).unwrap_err();
        assert!(matches!(err, BizmapError::Config { .. }));
    }

    #[test]
    fn test_resolve_policies() {
        let mut mapping = LabelMapping::new();
        mapping.insert("Tavern", "Bars");
        assert_eq!(mapping.resolve(Some("Tavern"), UnmappedPolicy::Drop), Some("Bars"));
        assert_eq!(mapping.resolve(Some("New"), UnmappedPolicy::Bucket), Some(UNCLASSIFIED));
        assert_eq!(mapping.resolve(None, UnmappedPolicy::Bucket), Some(UNCLASSIFIED));
        assert_eq!(mapping.resolve(Some("New"), UnmappedPolicy::Drop), None);
    }

    #[test]
    fn test_rows_round_trip() {
        let mut mapping = LabelMapping::new();
        mapping.insert("grocery", "Grocery Stores");
        mapping.insert("deli", "Grocery Stores");
        mapping.insert("bar", "Drinking Places");
        mapping.set_code("Grocery Stores", "4451");

        let rows = mapping.to_rows();
        assert_eq!(rows[0].clean_activity, "Drinking Places");
        assert_eq!(rows[1].raw_activity, "deli");
        assert_eq!(rows[1].code.as_deref(), Some("4451"));
        assert_eq!(LabelMapping::from_rows(rows), mapping);
    }

    #[test]
    fn test_config_validation() {
        let bad = ConsolidationConfig {
            distance_threshold: f64::NAN,
            ..ConsolidationConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!("taxonomy".parse::<ConsolidationStrategy>().is_ok());
        assert!("drop".parse::<UnmappedPolicy>().is_ok());
    }
}
