use std::{fs, path::Path};

use anyhow::{Context, Result};
use ciphermed_confidential::PatientRecord;

/// The record exchanged when none is given on the command line.
#[must_use]
pub const fn sample_record() -> PatientRecord {
    PatientRecord {
        patient_id: 420,
        age: 40,
        gender: true,
        blood_type: 1,
        weight: 70,
        height: 170,
        allergies: [false, true, false, true, false],
    }
}

/// Reads a patient record from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not a valid record, or
/// holds values that do not fit the record schema.
pub fn load_record<P: AsRef<Path>>(path: P) -> Result<PatientRecord> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read record file {}", path.display()))?;
    let record: PatientRecord = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse record file {}", path.display()))?;
    PatientRecord::SCHEMA
        .check(&record.to_fields())
        .context("Record does not fit the patient record schema")?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_record() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "patient_id": 430,
                "age": 70,
                "gender": true,
                "blood_type": 1,
                "weight": 75,
                "height": 175,
                "allergies": [true, false, false, true, true]
            }}"#
        )
        .unwrap();

        let record = load_record(file.path()).unwrap();
        assert_eq!(record.to_fields(), vec![430, 70, 1, 1, 75, 175, 1, 0, 0, 1, 1]);
    }

    #[test]
    fn test_load_record_rejects_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"patient_id": 1, "age": 2}}"#).unwrap();
        assert!(load_record(file.path()).is_err());
        assert!(load_record("/nonexistent/record.json").is_err());
    }

    #[test]
    fn test_sample_record_fits_schema() {
        assert!(PatientRecord::SCHEMA.check(&sample_record().to_fields()).is_ok());
    }
}
