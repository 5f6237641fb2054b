use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{FieldKind, FieldSpec, RecordSchema};

/// Number of allergy flags carried by a patient record
pub const ALLERGY_COUNT: usize = 5;

const PATIENT_RECORD_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("patient_id", FieldKind::U64),
    FieldSpec::new("age", FieldKind::U8),
    FieldSpec::new("gender", FieldKind::Bool),
    FieldSpec::new("blood_type", FieldKind::U8),
    FieldSpec::new("weight", FieldKind::U16),
    FieldSpec::new("height", FieldKind::U16),
    FieldSpec::new("allergy_peanuts", FieldKind::Bool),
    FieldSpec::new("allergy_latex", FieldKind::Bool),
    FieldSpec::new("allergy_bees", FieldKind::Bool),
    FieldSpec::new("allergy_wasps", FieldKind::Bool),
    FieldSpec::new("allergy_cats", FieldKind::Bool),
];

/// A patient's medical record, the plaintext unit of exchange.
///
/// On the wire the record is flattened, in declaration order, into the eleven
/// fields of [`PatientRecord::SCHEMA`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    /// Unique patient identifier
    pub patient_id: u64,
    /// Age in years
    pub age: u8,
    pub gender: bool,
    /// Blood type code, agreed upon out of band (e.g. `1` for A+)
    pub blood_type: u8,
    /// Weight in kilograms
    pub weight: u16,
    /// Height in centimetres
    pub height: u16,
    /// Allergy flags: peanuts, latex, bees, wasps, cats
    pub allergies: [bool; ALLERGY_COUNT],
}

impl PatientRecord {
    /// The field layout shared by the encrypting and decrypting parties.
    pub const SCHEMA: RecordSchema = RecordSchema::new("patient_record", PATIENT_RECORD_FIELDS);

    /// Flattens the record into its schema-ordered field values.
    #[must_use]
    pub fn to_fields(&self) -> Vec<u128> {
        let mut fields = vec![
            u128::from(self.patient_id),
            u128::from(self.age),
            u128::from(self.gender),
            u128::from(self.blood_type),
            u128::from(self.weight),
            u128::from(self.height),
        ];
        fields.extend(self.allergies.iter().map(|&flag| u128::from(flag)));
        fields
    }

    /// Rebuilds a record from schema-ordered field values.
    ///
    /// # Errors
    ///
    /// Returns `RecordError` if the number of values is wrong or a value does not
    /// fit its field.
    pub fn from_fields(fields: &[u128]) -> Result<Self, RecordError> {
        Self::SCHEMA.check(fields)?;
        let mut allergies = [false; ALLERGY_COUNT];
        for (flag, &value) in allergies.iter_mut().zip(&fields[6..]) {
            *flag = value == 1;
        }
        Ok(Self {
            patient_id: narrow(fields[0], "patient_id")?,
            age: narrow(fields[1], "age")?,
            gender: fields[2] == 1,
            blood_type: narrow(fields[3], "blood_type")?,
            weight: narrow(fields[4], "weight")?,
            height: narrow(fields[5], "height")?,
            allergies,
        })
    }
}

impl TryFrom<&[u128]> for PatientRecord {
    type Error = RecordError;

    fn try_from(fields: &[u128]) -> Result<Self, Self::Error> {
        Self::from_fields(fields)
    }
}

fn narrow<T: TryFrom<u128>>(value: u128, field: &'static str) -> Result<T, RecordError> {
    T::try_from(value).map_err(|_| RecordError::Narrowing { field, value })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record does not match schema: `{0}`")]
    Schema(#[from] crate::schema::SchemaError),
    #[error("Field `{field}` value {value} does not fit its type")]
    Narrowing { field: &'static str, value: u128 },
}
