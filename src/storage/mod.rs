//! # Partition Store
//!
//! One MessagePack file per canonical label plus the mapping index, all in a
//! single data directory.
//!
//! Batch output is written to a sibling staging directory and swapped in
//! with renames once every file is on disk, so readers never see a half
//! written dataset.

pub mod geojson;
pub mod index;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::consolidation::LabelMapping;
use crate::crs::Crs;
use crate::error::{BizmapError, Result};
use crate::records::{GeoRecordCollection, MasterCollection, RawActivityRecord};

pub use index::{read_mapping_csv, write_mapping_csv};

/// Name of the mapping index inside the data directory.
pub const INDEX_FILE: &str = "cluster_index.csv";
/// Extension of partition files.
pub const PARTITION_EXTENSION: &str = "msgpack";
/// Longest sanitized partition name, in characters.
pub const MAX_PARTITION_NAME: usize = 149;
/// Longest sanitized partition name, in UTF-8 bytes. Leaves room for the
/// extension under the usual 255-byte file name limit.
pub const MAX_PARTITION_NAME_BYTES: usize = 200;

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/*?:"<>|\x00-\x1f]"#).expect("unsafe character pattern is valid"));

/// Filesystem-safe partition name for a canonical label.
pub fn sanitize_label(label: &str) -> String {
    let mut end = 0;
    for (count, (idx, ch)) in label.char_indices().enumerate() {
        let next = idx + ch.len_utf8();
        if count == MAX_PARTITION_NAME || next > MAX_PARTITION_NAME_BYTES {
            break;
        }
        end = next;
    }
    // Replacements are single-byte, so the byte bound still holds
    let cleaned = UNSAFE_CHARS.replace_all(&label[..end], "_").into_owned();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// On-disk partition payload. Labels that sanitize to the same name share
/// one file.
#[derive(Debug, Serialize, Deserialize)]
struct PartitionFile {
    labels: Vec<String>,
    crs: Crs,
    records: Vec<RawActivityRecord>,
}

/// Directory of partitions and the mapping index.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, label: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", sanitize_label(label), PARTITION_EXTENSION))
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Write a single partition in place, replacing any existing file.
    pub fn write_partition(&self, label: &str, collection: &GeoRecordCollection) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| BizmapError::io(&self.root, e))?;
        let path = self.partition_path(label);
        let file = PartitionFile {
            labels: vec![label.to_string()],
            crs: collection.crs(),
            records: collection.records().to_vec(),
        };
        write_partition_file(&path, &file)?;
        Ok(path)
    }

    /// Records of one canonical label.
    pub fn read_partition(&self, label: &str) -> Result<GeoRecordCollection> {
        let path = self.partition_path(label);
        if !path.exists() {
            return Err(BizmapError::MissingData {
                label: label.to_string(),
            });
        }
        let file = read_partition_file(&path)?;
        if !file.labels.iter().any(|l| l == label) {
            return Err(BizmapError::MissingData {
                label: label.to_string(),
            });
        }
        let shared = file.labels.len() > 1;
        let records = file
            .records
            .into_iter()
            .filter(|r| !shared || r.category.as_deref() == Some(label))
            .collect();
        Ok(GeoRecordCollection::new(file.crs, records))
    }

    /// Partition files in name order.
    pub fn list_partitions(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.root).map_err(|e| BizmapError::io(&self.root, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| BizmapError::io(&self.root, e))?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(PARTITION_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Load every partition into one master collection.
    ///
    /// Records keep partition-file order then stored order. Partitions in a
    /// different CRS than the first are reprojected into it.
    pub fn load_master(&self) -> Result<MasterCollection> {
        let mut master: Option<GeoRecordCollection> = None;
        let paths = self.list_partitions()?;
        for path in &paths {
            let file = read_partition_file(path)?;
            let part = GeoRecordCollection::new(file.crs, file.records);
            match master.as_mut() {
                None => master = Some(part),
                Some(all) => {
                    let part = if part.crs() == all.crs() { part } else { part.reproject(all.crs()) };
                    all.extend_from(part)?;
                }
            }
        }
        let master = master.unwrap_or_else(|| GeoRecordCollection::empty(Crs::Wgs84));
        log::info!(
            "[Store] Loaded {} records from {} partitions in {}",
            master.len(),
            paths.len(),
            self.root.display()
        );
        Ok(MasterCollection::new(master))
    }

    pub fn read_mapping(&self) -> Result<LabelMapping> {
        Ok(LabelMapping::from_rows(read_mapping_csv(&self.index_path())?))
    }

    /// Replace the whole store with `partitions` and `mapping`.
    ///
    /// Either every file lands or the previous contents stay untouched.
    pub fn write_batch(&self, partitions: &BTreeMap<String, GeoRecordCollection>, mapping: &LabelMapping) -> Result<()> {
        let staging = self.sibling("staging")?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| BizmapError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging).map_err(|e| BizmapError::io(&staging, e))?;

        if let Err(e) = self.stage(&staging, partitions, mapping) {
            log::error!("[Store] Batch write failed, keeping previous data: {}", e);
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let previous = self.sibling("previous")?;
        if previous.exists() {
            fs::remove_dir_all(&previous).map_err(|e| BizmapError::io(&previous, e))?;
        }
        if self.root.exists() {
            fs::rename(&self.root, &previous).map_err(|e| BizmapError::io(&self.root, e))?;
        }
        if let Err(e) = fs::rename(&staging, &self.root) {
            if previous.exists() {
                let _ = fs::rename(&previous, &self.root);
            }
            return Err(BizmapError::io(&staging, e));
        }
        if previous.exists() {
            if let Err(e) = fs::remove_dir_all(&previous) {
                log::warn!("[Store] Could not remove {}: {}", previous.display(), e);
            }
        }

        log::info!(
            "[Store] Wrote {} partitions and {} index rows to {}",
            partitions.len(),
            mapping.len(),
            self.root.display()
        );
        Ok(())
    }

    fn stage(&self, staging: &Path, partitions: &BTreeMap<String, GeoRecordCollection>, mapping: &LabelMapping) -> Result<()> {
        // Group labels whose sanitized names collide
        let mut files: BTreeMap<String, PartitionFile> = BTreeMap::new();
        for (label, collection) in partitions {
            let name = sanitize_label(label);
            match files.get_mut(&name) {
                Some(file) => {
                    log::warn!("[Store] '{}' shares partition file '{}' with {:?}", label, name, file.labels);
                    let part = collection.reproject(file.crs);
                    file.labels.push(label.clone());
                    file.records.extend(part.into_records());
                }
                None => {
                    files.insert(
                        name,
                        PartitionFile {
                            labels: vec![label.clone()],
                            crs: collection.crs(),
                            records: collection.records().to_vec(),
                        },
                    );
                }
            }
        }

        for (name, file) in &files {
            let path = staging.join(format!("{}.{}", name, PARTITION_EXTENSION));
            write_partition_file(&path, file)?;
        }
        write_mapping_csv(&mapping.to_rows(), &staging.join(INDEX_FILE))
    }

    fn sibling(&self, suffix: &str) -> Result<PathBuf> {
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BizmapError::Config {
                message: format!("data dir {} has no usable name", self.root.display()),
            })?;
        Ok(self.root.with_file_name(format!(".{}.{}", name, suffix)))
    }
}

fn write_partition_file(path: &Path, file: &PartitionFile) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(file).map_err(BizmapError::serialization)?;
    fs::write(path, bytes).map_err(|e| BizmapError::io(path, e))
}

fn read_partition_file(path: &Path) -> Result<PartitionFile> {
    let bytes = fs::read(path).map_err(|e| BizmapError::io(path, e))?;
    rmp_serde::from_slice(&bytes)
        .map_err(|e| BizmapError::serialization(format!("{}: {}", path.display(), e)))
}
