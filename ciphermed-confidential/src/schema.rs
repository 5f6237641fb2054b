//! Statically declared record schemas.
//!
//! A [`RecordSchema`] is the ordered list of typed fields that both the
//! encrypting and the decrypting side agree on. Schemas declared in a `const`
//! are validated at compile time; schemas assembled at runtime go through
//! [`RecordSchema::try_new`].

use thiserror::Error;

/// Maximum number of fields a record schema may declare.
pub const MAX_FIELDS: usize = 64;

/// The type of a single record field, which fixes its bit width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// A boolean encoded as `0` or `1`
    Bool,
    U8,
    U16,
    U32,
    U64,
    U128,
}

impl FieldKind {
    /// Number of significant bits a value of this kind may occupy.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::U8 => 8,
            Self::U16 => 16,
            Self::U32 => 32,
            Self::U64 => 64,
            Self::U128 => 128,
        }
    }

    /// Largest value representable by this kind.
    #[must_use]
    pub const fn max_value(self) -> u128 {
        match self {
            Self::U128 => u128::MAX,
            kind => (1u128 << kind.bits()) - 1,
        }
    }

    /// Returns `true` if `value` fits within this kind's width.
    #[must_use]
    pub const fn admits(self, value: u128) -> bool {
        value <= self.max_value()
    }
}

/// A named, typed field in a record schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
}

impl FieldSpec {
    #[must_use]
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }
}

/// An ordered, validated list of record fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSchema {
    name: &'static str,
    fields: &'static [FieldSpec],
}

impl RecordSchema {
    /// Declares a schema.
    ///
    /// # Panics
    ///
    /// Panics if the schema is empty, declares more than [`MAX_FIELDS`] fields,
    /// or repeats a field name. When called in a `const` item the panic is a
    /// compile error.
    #[must_use]
    pub const fn new(name: &'static str, fields: &'static [FieldSpec]) -> Self {
        match validate(fields) {
            Ok(()) => Self { name, fields },
            Err(SchemaViolation::Empty) => panic!("record schema must declare at least one field"),
            Err(SchemaViolation::TooManyFields) => panic!("record schema declares too many fields"),
            Err(SchemaViolation::DuplicateField(_)) => panic!("record schema repeats a field name"),
        }
    }

    /// Declares a schema, reporting validation failures as errors.
    ///
    /// # Errors
    ///
    /// Returns a `SchemaError` if the schema is empty, too large, or repeats a
    /// field name.
    pub fn try_new(
        name: &'static str,
        fields: &'static [FieldSpec],
    ) -> Result<Self, SchemaError> {
        match validate(fields) {
            Ok(()) => Ok(Self { name, fields }),
            Err(SchemaViolation::Empty) => Err(SchemaError::Empty(name)),
            Err(SchemaViolation::TooManyFields) => Err(SchemaError::TooManyFields {
                schema: name,
                count: fields.len(),
            }),
            Err(SchemaViolation::DuplicateField(index)) => Err(SchemaError::DuplicateField {
                schema: name,
                field: fields[index].name,
            }),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always `false` for a validated schema.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks a plaintext record against this schema.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::FieldCount` if the number of values differs from
    /// the number of fields, or `SchemaError::OutOfRange` for the first value
    /// that exceeds its field's width.
    pub fn check(&self, values: &[u128]) -> Result<(), SchemaError> {
        if values.len() != self.fields.len() {
            return Err(SchemaError::FieldCount {
                schema: self.name,
                expected: self.fields.len(),
                actual: values.len(),
            });
        }
        for (field, &value) in self.fields.iter().zip(values) {
            if !field.kind.admits(value) {
                return Err(SchemaError::OutOfRange {
                    field: field.name,
                    value,
                    bits: field.kind.bits(),
                });
            }
        }
        Ok(())
    }
}

enum SchemaViolation {
    Empty,
    TooManyFields,
    DuplicateField(usize),
}

const fn validate(fields: &[FieldSpec]) -> Result<(), SchemaViolation> {
    if fields.is_empty() {
        return Err(SchemaViolation::Empty);
    }
    if fields.len() > MAX_FIELDS {
        return Err(SchemaViolation::TooManyFields);
    }
    let mut i = 0;
    while i < fields.len() {
        let mut j = i + 1;
        while j < fields.len() {
            if str_eq(fields[i].name, fields[j].name) {
                return Err(SchemaViolation::DuplicateField(j));
            }
            j += 1;
        }
        i += 1;
    }
    Ok(())
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Schema `{0}` declares no fields")]
    Empty(&'static str),
    #[error("Schema `{schema}` declares {count} fields, more than the supported maximum")]
    TooManyFields { schema: &'static str, count: usize },
    #[error("Schema `{schema}` repeats field `{field}`")]
    DuplicateField {
        schema: &'static str,
        field: &'static str,
    },
    #[error("Schema `{schema}` expects {expected} fields, got {actual}")]
    FieldCount {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Field `{field}` value {value} does not fit in {bits} bits")]
    OutOfRange {
        field: &'static str,
        value: u128,
        bits: u32,
    },
}
