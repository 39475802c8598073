//! Industry taxonomy (NAICS-style code/description list).

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::embedding::cosine_similarity;
use crate::error::{BizmapError, Result};

/// `NAICS`, `NAICS07`, `NAICS12` ... followed by a numeric code.
static ENTRY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"NAICS\d*\s+(\d+)\s+").expect("entry header pattern is valid"));

/// Column of the titles CSV holding the concatenated entries.
pub const TITLE_COLUMN: &str = "industry_title";

/// One taxonomy entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyEntry {
    pub code: String,
    pub description: String,
}

/// Ordered list of taxonomy entries with unique descriptions.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
    by_description: HashMap<String, usize>,
}

impl Taxonomy {
    /// Build from `(code, description)` pairs. A repeated description keeps
    /// its first position and the last code.
    pub fn new<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut taxonomy = Taxonomy::default();
        for (code, description) in pairs {
            taxonomy.insert(code, description);
        }
        taxonomy
    }

    fn insert(&mut self, code: String, description: String) {
        match self.by_description.get(&description) {
            Some(&idx) => self.entries[idx].code = code,
            None => {
                self.by_description.insert(description.clone(), self.entries.len());
                self.entries.push(TaxonomyEntry { code, description });
            }
        }
    }

    /// Parse a concatenated title blob such as
    /// `"NAICS07 4451 Grocery Stores NAICS12 4452 Specialty Food Stores"`.
    ///
    /// Only codes of exactly `digits` digits are kept. Digits stuck to the
    /// end of a description are stripped.
    pub fn parse_blob(blob: &str, digits: usize) -> Result<Self> {
        if !(2..=6).contains(&digits) {
            return Err(BizmapError::invalid("digits", format!("{} is not a taxonomy level (2-6)", digits)));
        }

        let mut taxonomy = Taxonomy::default();
        for caps in ENTRY_HEADER.captures_iter(blob) {
            let (Some(whole), Some(code)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if code.as_str().len() != digits {
                continue;
            }
            let tail = &blob[whole.end()..];
            let end = tail.find("NAICS").unwrap_or(tail.len());
            let description = tail[..end]
                .trim()
                .trim_end_matches(|c: char| c.is_ascii_digit())
                .trim_end();
            if !description.is_empty() {
                taxonomy.insert(code.as_str().to_string(), description.to_string());
            }
        }
        Ok(taxonomy)
    }

    /// Read a titles CSV and parse the joined `industry_title` column.
    pub fn from_titles_csv(path: &Path, digits: usize) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| BizmapError::Taxonomy {
            message: format!("{}: {}", path.display(), e),
        })?;
        let headers = reader.headers().map_err(|e| BizmapError::Taxonomy {
            message: e.to_string(),
        })?;
        let column = headers
            .iter()
            .position(|h| h == TITLE_COLUMN)
            .ok_or_else(|| BizmapError::Taxonomy {
                message: format!("{} has no '{}' column", path.display(), TITLE_COLUMN),
            })?;

        let mut titles = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| BizmapError::Taxonomy { message: e.to_string() })?;
            if let Some(title) = row.get(column).filter(|t| !t.is_empty()) {
                titles.push(title.to_string());
            }
        }
        let taxonomy = Self::parse_blob(&titles.join(" "), digits)?;
        log::info!(
            "[Consolidator] Loaded {} taxonomy entries at {} digits from {}",
            taxonomy.len(),
            digits,
            path.display()
        );
        Ok(taxonomy)
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.description.clone()).collect()
    }

    /// Code of the entry with this exact description.
    pub fn code_for(&self, description: &str) -> Option<&str> {
        self.by_description
            .get(description)
            .map(|&idx| self.entries[idx].code.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Best taxonomy entry for each query vector, accepted only when the cosine
/// similarity is strictly above `floor`. Ties go to the earlier entry.
pub fn match_to_taxonomy(queries: &[Vec<f32>], corpus: &[Vec<f32>], floor: f32) -> Vec<Option<usize>> {
    queries
        .iter()
        .map(|query| {
            let mut best: Option<(usize, f32)> = None;
            for (idx, candidate) in corpus.iter().enumerate() {
                let score = cosine_similarity(query, candidate);
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((idx, score));
                }
            }
            best.filter(|&(_, score)| score > floor).map(|(idx, _)| idx)
        })
        .collect()
}
