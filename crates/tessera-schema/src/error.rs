//! Error types for the schema layer

use thiserror::Error;

use tessera_core::StoreError;

#[derive(Debug, Clone, Error)]
pub enum SchemaError {
    /// Record store error, passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// @ATTRIBUTES carries an unknown flag token or an unsupported combination
    #[error("Malformed schema in {record}: {reason}")]
    MalformedSchema { record: String, reason: String },

    /// A stored record could not be decoded
    #[error("Malformed record {dn}: {reason}")]
    MalformedRecord { dn: String, reason: String },

    /// The sequence number cannot be incremented without wrapping
    #[error("Sequence number {current} cannot be incremented")]
    SequenceOverflow { current: u64 },

    /// A record that must exist is absent
    #[error("Record not found: {dn}")]
    NotFound { dn: String },

    /// Operation on a closed database or other invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SchemaError {
    pub(crate) fn malformed_schema(record: &str, reason: impl Into<String>) -> Self {
        SchemaError::MalformedSchema {
            record: record.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_record(dn: &str, reason: impl Into<String>) -> Self {
        SchemaError::MalformedRecord {
            dn: dn.to_string(),
            reason: reason.into(),
        }
    }
}

pub type SchemaResult<T> = Result<T, SchemaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_pass_through() {
        let err: SchemaError = StoreError::NotFound { key: b"DN=cn=x".to_vec() }.into();
        assert!(matches!(err, SchemaError::Store(StoreError::NotFound { .. })));
        assert_eq!(err.to_string(), "Key not found: \"DN=cn=x\"");
    }

    #[test]
    fn test_display() {
        let err = SchemaError::malformed_schema("@ATTRIBUTES", "unknown flag BOGUS on cn");
        assert_eq!(err.to_string(), "Malformed schema in @ATTRIBUTES: unknown flag BOGUS on cn");
        let err = SchemaError::SequenceOverflow { current: u64::MAX };
        assert!(err.to_string().contains("18446744073709551615"));
    }
}
