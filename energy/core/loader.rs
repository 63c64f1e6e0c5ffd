//! CSV ingestion of raw building records.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::record::RawRecord;

/// Errors raised while reading the input file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Input file does not exist.
    #[error("input file {0:?} not found")]
    FileNotFound(PathBuf),
    /// Filesystem failure after the existence check.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed CSV or a missing/unparseable column.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Reads every row of the input file. Headers and fields are trimmed, so
/// `" Temperature "` still maps onto `Temperature`.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<RawRecord>, LoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LoadError::FileNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    read_records(BufReader::new(file))
}

/// Reads raw records from any CSV source.
pub fn read_records(source: impl Read) -> Result<Vec<RawRecord>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let mut records = Vec::new();
    for row in reader.deserialize::<RawRecord>() {
        records.push(row?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
Timestamp , Temperature,Humidity,SquareFootage,Occupancy,HVACUsage,LightingUsage,RenewableEnergy,DayOfWeek,Holiday,EnergyConsumption
2022-01-01 00:00:00,25.1,43.4,1565.7,5,On,Off,2.77,Monday,No,75.36
2022-01-01 01:00:00,27.7,54.2,1411.0,1,On,On,21.83,Saturday,No,
";

    #[test]
    fn missing_file_fails_fast() {
        let dir = tempdir().unwrap();
        let err = load_records(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound(_)));
    }

    #[test]
    fn reads_trimmed_headers_and_optional_target() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Energy_consumption.csv");
        fs::write(&path, SAMPLE).unwrap();
        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, "2022-01-01 00:00:00");
        assert_eq!(records[0].energy_consumption, Some(75.36));
        assert_eq!(records[1].energy_consumption, None);
        assert_eq!(records[1].lighting_usage, "On");
    }

    #[test]
    fn rejects_non_numeric_measurements() {
        let broken = SAMPLE.replace("25.1", "warm");
        let err = read_records(broken.as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::Csv(_)));
    }
}
