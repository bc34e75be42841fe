//! Error types for the cohort_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cohort_core operations
///
/// Data-quality problems are not errors; they are reported as
/// [`Diagnostic`](crate::Diagnostic)s alongside a successful result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed call arguments, raised before any data is fetched
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unrecognized schema version
    #[error(
        "The data version '{version}' is not found in the list of valid versions: {}",
        valid.join(", ")
    )]
    Version { version: String, valid: Vec<String> },

    /// Internal invariant violated while producing a result
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// A computed value does not fit its integer column
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// Failure reported by a data source
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Malformed value in tabular input
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_error_lists_valid_versions() {
        let err = Error::Version {
            version: "r99".into(),
            valid: vec!["rel_22r1".into(), "rel_23r1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'r99'"));
        assert!(msg.contains("rel_22r1, rel_23r1"));
    }
}
