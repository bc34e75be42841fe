//! Built-in catalog of schema versions and measurement scales.
//!
//! The version table maps each data release to the schema names a data
//! source needs to build its queries. It is immutable; callers reach it through
//! [`Config::versions`](crate::Config) rather than a process-wide lookup.

use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Schema names for one data release
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaVersion {
    /// Clinical data schema
    pub cdt: String,
    /// Vocabulary schema
    pub vocab: String,
    /// Reference schema
    #[serde(rename = "ref")]
    pub reference: String,
    /// Common data model generation
    pub cdm: String,
}

impl SchemaVersion {
    fn release(name: &str, cdt_suffix: &str, cdm: &str) -> Self {
        Self {
            cdt: format!("{}_{}", name, cdt_suffix),
            vocab: format!("{}_vocabulary", name),
            reference: if cdt_suffix == "dcdm" {
                format!("{}_dref", name)
            } else {
                format!("{}_ref", name)
            },
            cdm: cdm.into(),
        }
    }
}

/// Lookup table of known schema versions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct VersionTable(BTreeMap<String, SchemaVersion>);

/// Cached default table, built once
static DEFAULT_VERSIONS: Lazy<VersionTable> = Lazy::new(build_default_versions);

/// Get a reference to the built-in version table
pub fn default_versions() -> &'static VersionTable {
    &DEFAULT_VERSIONS
}

fn build_default_versions() -> VersionTable {
    let mut versions = BTreeMap::new();

    for name in ["r20r1", "r21r1"] {
        versions.insert(name.to_string(), SchemaVersion::release(name, "dcdm", "cdm1.0"));
    }
    for name in ["rel_21r2", "rel_22r1"] {
        versions.insert(name.to_string(), SchemaVersion::release(name, "cdm", "cdm1.0"));
    }
    for name in ["rel_22r2", "rel_22r3", "rel_22r4", "rel_22r5", "rel_23r1"] {
        versions.insert(name.to_string(), SchemaVersion::release(name, "cdm", "cdm2.0"));
    }

    VersionTable(versions)
}

impl Default for VersionTable {
    fn default() -> Self {
        default_versions().clone()
    }
}

impl VersionTable {
    /// Look up `version`, failing with [`Error::Version`] when it is unknown
    pub fn validate(&self, version: &str) -> Result<&SchemaVersion> {
        self.0.get(version).ok_or_else(|| Error::Version {
            version: version.to_string(),
            valid: self.names(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Measurement Scales
// ============================================================================

/// Rating scales the aggregation engine knows how to request
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Scale {
    /// Clinical Global Impression - Severity
    #[serde(rename = "CGI-S")]
    CgiS,
    /// Clinical Global Impression - Improvement
    #[serde(rename = "CGI-I")]
    CgiI,
    /// Global Assessment of Functioning
    #[serde(rename = "GAF")]
    Gaf,
}

impl Scale {
    pub const ALL: [Scale; 3] = [Scale::CgiS, Scale::CgiI, Scale::Gaf];

    pub fn as_str(self) -> &'static str {
        match self {
            Scale::CgiS => "CGI-S",
            Scale::CgiI => "CGI-I",
            Scale::Gaf => "GAF",
        }
    }

    /// CGI ratings run 1-7, so a zero is a recording error
    pub fn rejects_zero(self) -> bool {
        matches!(self, Scale::CgiS | Scale::CgiI)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Scale::ALL
            .into_iter()
            .find(|scale| scale.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let known: Vec<_> = Scale::ALL.iter().map(|s| s.as_str()).collect();
                Error::invalid(format!(
                    "unknown scale '{}', expected one of: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}
