//! Core value types shared by the consolidation and aggregation engines.
//!
//! Every type here is a plain value object: created per call, owned by the
//! caller once returned, never mutated by the engines after construction.

use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Patient identifier (always >= 1)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PatientId(pub i64);

impl PatientId {
    /// Build a patient id, rejecting non-positive values
    pub fn new(raw: i64) -> Result<Self> {
        if raw < 1 {
            return Err(Error::invalid(format!(
                "patient id must be a positive integer, got {}",
                raw
            )));
        }
        Ok(PatientId(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive number of days in `[start, end]`
pub fn inclusive_days(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

// ============================================================================
// Cohort Types
// ============================================================================

/// A cohort member with an absolute observation window `[start_date, end_date]`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CohortMember {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl CohortMember {
    pub fn new(patient_id: PatientId, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            patient_id,
            start_date,
            end_date,
        }
    }

    /// Length of the observation window in days (inclusive)
    pub fn period_days(&self) -> i64 {
        inclusive_days(self.start_date, self.end_date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// A cohort member anchored on a reference (index) date
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedMember {
    pub patient_id: PatientId,
    pub index_date: NaiveDate,
}

/// Observation period recorded for a patient
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservationPeriod {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

// ============================================================================
// Visit Types
// ============================================================================

/// A raw visit row as returned by a [`VisitSource`](crate::VisitSource)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisitRecord {
    pub patient_id: PatientId,
    pub visit_start: NaiveDate,
    pub visit_end: NaiveDate,
    pub visit_type: String,
}

impl VisitRecord {
    /// Build a visit row; `visit_end` may not precede `visit_start`
    pub fn new(
        patient_id: PatientId,
        visit_start: NaiveDate,
        visit_end: NaiveDate,
        visit_type: impl Into<String>,
    ) -> Result<Self> {
        if visit_end < visit_start {
            return Err(Error::invalid(format!(
                "visit for patient {} ends ({}) before it starts ({})",
                patient_id, visit_end, visit_start
            )));
        }
        Ok(Self {
            patient_id,
            visit_start,
            visit_end,
            visit_type: visit_type.into(),
        })
    }
}

/// Per-patient encounter counts, one entry per utilization label
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidatedVisitCount {
    pub patient_id: PatientId,
    /// Inclusive length of the observation window in days
    pub period_days: i64,
    /// `(label, count)` pairs in label-map order
    pub counts: Vec<(String, u32)>,
}

impl ConsolidatedVisitCount {
    /// Count recorded for `label`, if the label was requested
    pub fn count(&self, label: &str) -> Option<u32> {
        self.counts
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, count)| *count)
    }
}

// ============================================================================
// Measurement Types
// ============================================================================

/// A single scale reading
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecord {
    pub patient_id: PatientId,
    pub measurement_date: NaiveDate,
    pub value: f64,
}

/// One representative value per group
///
/// `measurement_date` is present only when grouping by patient and day.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatedMeasurement {
    pub patient_id: PatientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement_date: Option<NaiveDate>,
    pub agg_value: i64,
}

/// Change between two successive aggregated readings of one patient
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementDelta {
    pub patient_id: PatientId,
    pub prior_date: NaiveDate,
    pub prior_value: i64,
    pub current_date: NaiveDate,
    pub current_value: i64,
    pub days_between: i64,
    pub value_change: i64,
}

/// Data available on either side of a patient's index date
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaysAvailable {
    pub patient_id: PatientId,
    pub index_date: NaiveDate,
    pub observation_start: NaiveDate,
    pub observation_end: NaiveDate,
    pub pre_index_days: i64,
    pub post_index_days: i64,
}
