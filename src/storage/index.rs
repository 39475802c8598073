//! Mapping index CSV (`raw_activity,clean_activity,code`).

use std::path::Path;

use crate::consolidation::MappingRow;
use crate::error::{BizmapError, Result};

fn csv_error(path: &Path, e: csv::Error) -> BizmapError {
    match e.into_kind() {
        csv::ErrorKind::Io(source) => BizmapError::io(path, source),
        other => BizmapError::serialization(format!("{}: {:?}", path.display(), other)),
    }
}

pub fn read_mapping_csv(path: &Path) -> Result<Vec<MappingRow>> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    reader
        .deserialize()
        .map(|row| row.map_err(|e| csv_error(path, e)))
        .collect()
}

pub fn write_mapping_csv(rows: &[MappingRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for row in rows {
        writer.serialize(row).map_err(|e| csv_error(path, e))?;
    }
    writer.flush().map_err(|e| BizmapError::io(path, e))
}
