//! Data-source seams.
//!
//! The engines never talk to a database. They ask one of these traits for
//! already-typed rows and treat any error it returns as final: no retries,
//! no wrapping. Implementations must be reentrant if callers run engine
//! calls in parallel.

use crate::{
    CohortMember, MeasurementRecord, ObservationPeriod, PatientId, Result, Scale, SchemaVersion,
    VisitRecord,
};

/// Request for visit rows
#[derive(Clone, Copy, Debug)]
pub struct VisitQuery<'a> {
    /// Each patient's window; rows starting outside it are excluded
    pub periods: &'a [CohortMember],
    /// Source visit types, matched case-insensitively
    pub visit_types: &'a [String],
    pub version: &'a SchemaVersion,
    /// Keep encounters flagged as failed
    pub include_failed: bool,
}

/// Patients whose measurements are wanted
#[derive(Clone, Copy, Debug)]
pub enum MeasurementScope<'a> {
    /// Every reading for these patients
    Patients(&'a [PatientId]),
    /// Readings inside each member's `[start_date, end_date]`
    Periods(&'a [CohortMember]),
}

/// Request for scale readings
#[derive(Clone, Copy, Debug)]
pub struct MeasurementQuery<'a> {
    pub scope: MeasurementScope<'a>,
    pub scale: Scale,
    pub version: &'a SchemaVersion,
    pub include_failed: bool,
    /// Named database, if the source serves more than one
    pub dbname: Option<&'a str>,
}

/// Source of visit rows
pub trait VisitSource {
    fn fetch_visits(&self, query: &VisitQuery<'_>) -> Result<Vec<VisitRecord>>;
}

/// Source of scale readings
pub trait MeasurementSource {
    fn fetch_measurements(&self, query: &MeasurementQuery<'_>) -> Result<Vec<MeasurementRecord>>;
}

/// Source of recorded observation periods
pub trait ObservationSource {
    fn fetch_observation_periods(
        &self,
        patients: &[PatientId],
        version: &SchemaVersion,
    ) -> Result<Vec<ObservationPeriod>>;
}
