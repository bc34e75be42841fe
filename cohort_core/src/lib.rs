#![forbid(unsafe_code)]

//! Longitudinal clinical event consolidation and aggregation.
//!
//! This crate provides:
//! - Visit consolidation (overlap-merged encounter counts per utilization label)
//! - Measurement aggregation (mode-with-tiebreak policies, change tracking)
//! - Days of observation available around an index date
//! - Data-source seams plus an in-memory, CSV-backed implementation
//! - CSV export of every result relation

pub mod types;
pub mod error;
pub mod diagnostics;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod window;
pub mod source;
pub mod store;
pub mod visits;
pub mod measurements;
pub mod observation;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use diagnostics::{Diagnostic, Outcome};
pub use catalog::{default_versions, Scale, SchemaVersion, VersionTable};
pub use config::Config;
pub use window::RelativeWindow;
pub use source::{MeasurementSource, ObservationSource, VisitSource};
pub use store::MemoryStore;
pub use visits::{
    consolidate_visit_utilization, UtilizationLabel, UtilizationRequest, VisitCohort,
    VisitLabelMap,
};
pub use measurements::{
    aggregate_measurements, AggregationOutput, AggregationPolicy, MeasurementRequest,
    MeasurementSubject,
};
pub use observation::days_available;
