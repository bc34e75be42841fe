//! Measurement aggregation engine.
//!
//! Collapses repeated scale readings into one integer per patient (or per
//! patient and day), and optionally derives the change between successive
//! per-day readings of each patient.
//!
//! ## Policies
//!
//! | name          | per group                                             |
//! |---------------|-------------------------------------------------------|
//! | `mean`        | arithmetic mean                                       |
//! | `median`      | median                                                |
//! | `min`/`max`   | smallest / largest value                              |
//! | `mode_<stat>` | the mode; ties between modes resolved by `<stat>`     |
//!
//! Results are rounded half-to-even before the cast to an integer.

use crate::diagnostics::DiagnosticLog;
use crate::source::{MeasurementQuery, MeasurementScope, MeasurementSource};
use crate::{
    AggregatedMeasurement, CohortMember, Config, Diagnostic, Error, IndexedMember,
    MeasurementDelta, MeasurementRecord, Outcome, PatientId, RelativeWindow, Result, Scale,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Statistics
// ============================================================================

/// Plain statistic over a non-empty slice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Statistic {
    Mean,
    Median,
    Min,
    Max,
}

type Handler = fn(&[f64]) -> f64;

impl Statistic {
    fn handler(self) -> Handler {
        match self {
            Statistic::Mean => mean,
            Statistic::Median => median,
            Statistic::Min => min,
            Statistic::Max => max,
        }
    }

    pub fn apply(self, values: &[f64]) -> f64 {
        (self.handler())(values)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Values occurring with maximal frequency, ascending
pub fn modal_values(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut runs: Vec<(f64, usize)> = Vec::new();
    for value in sorted {
        match runs.last_mut() {
            Some((last, count)) if *last == value => *count += 1,
            _ => runs.push((value, 1)),
        }
    }

    let top = runs.iter().map(|(_, count)| *count).max().unwrap_or(0);
    runs.into_iter()
        .filter(|(_, count)| *count == top)
        .map(|(value, _)| value)
        .collect()
}

/// Round half-to-even and cast
///
/// Fails with [`Error::OutOfRange`] when the rounded value does not fit an
/// `i64`, instead of saturating.
pub fn round_to_integer(value: f64) -> Result<i64> {
    let rounded = value.round_ties_even();
    // i64::MAX as f64 is 2^63, one past the largest i64
    if rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
        Ok(rounded as i64)
    } else {
        Err(Error::OutOfRange(format!(
            "aggregate {} does not fit in a 64-bit integer",
            value
        )))
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Closed set of aggregation policies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Apply the statistic to every value in the group
    Plain(Statistic),
    /// Take the mode; if several values tie, apply the statistic to them
    ModeThen(Statistic),
}

const POLICIES: [(&str, AggregationPolicy); 8] = [
    ("mean", AggregationPolicy::Plain(Statistic::Mean)),
    ("median", AggregationPolicy::Plain(Statistic::Median)),
    ("max", AggregationPolicy::Plain(Statistic::Max)),
    ("min", AggregationPolicy::Plain(Statistic::Min)),
    ("mode_median", AggregationPolicy::ModeThen(Statistic::Median)),
    ("mode_mean", AggregationPolicy::ModeThen(Statistic::Mean)),
    ("mode_min", AggregationPolicy::ModeThen(Statistic::Min)),
    ("mode_max", AggregationPolicy::ModeThen(Statistic::Max)),
];

impl AggregationPolicy {
    /// Names accepted by [`FromStr`]
    pub fn names() -> Vec<&'static str> {
        POLICIES.iter().map(|(name, _)| *name).collect()
    }

    pub fn name(self) -> &'static str {
        POLICIES
            .iter()
            .find(|(_, policy)| *policy == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Representative value of a non-empty group, before rounding
    pub fn evaluate(self, values: &[f64]) -> f64 {
        match self {
            AggregationPolicy::Plain(stat) => stat.apply(values),
            AggregationPolicy::ModeThen(stat) => {
                let modes = modal_values(values);
                match modes.as_slice() {
                    [single] => *single,
                    tied => stat.apply(tied),
                }
            }
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        POLICIES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, policy)| *policy)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "unknown aggregation policy '{}', expected one of: {}",
                    s,
                    Self::names().join(", ")
                ))
            })
    }
}

// ============================================================================
// Pure Aggregation
// ============================================================================

/// Group key granularity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grouping {
    Patient,
    PatientDay,
}

type GroupKey = (PatientId, Option<NaiveDate>);

fn group_key(record: &MeasurementRecord, grouping: Grouping) -> GroupKey {
    match grouping {
        Grouping::Patient => (record.patient_id, None),
        Grouping::PatientDay => (record.patient_id, Some(record.measurement_date)),
    }
}

/// Number of distinct group keys among the finite readings
fn distinct_group_count(records: &[MeasurementRecord], grouping: Grouping) -> usize {
    records
        .iter()
        .filter(|r| r.value.is_finite())
        .map(|r| group_key(r, grouping))
        .collect::<HashSet<_>>()
        .len()
}

/// Fails with [`Error::Consistency`] unless there is one row per expected key
fn check_row_count(rows: &[AggregatedMeasurement], expected: usize) -> Result<()> {
    if rows.len() != expected {
        return Err(Error::Consistency(format!(
            "produced {} aggregated rows for {} distinct groups",
            rows.len(),
            expected
        )));
    }
    Ok(())
}

/// One aggregated row per distinct group key, sorted by key
///
/// Non-finite values are ignored. Fails with [`Error::Consistency`] if the
/// number of rows produced differs from the number of distinct keys in the
/// input, and with [`Error::OutOfRange`] if an aggregate overflows `i64`.
pub fn aggregate_records(
    records: &[MeasurementRecord],
    policy: AggregationPolicy,
    grouping: Grouping,
) -> Result<Vec<AggregatedMeasurement>> {
    let expected = distinct_group_count(records, grouping);

    let mut groups: BTreeMap<GroupKey, Vec<f64>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.value.is_finite()) {
        groups
            .entry(group_key(record, grouping))
            .or_default()
            .push(record.value);
    }

    let rows = groups
        .into_iter()
        .map(|((patient_id, measurement_date), values)| {
            Ok(AggregatedMeasurement {
                patient_id,
                measurement_date,
                agg_value: round_to_integer(policy.evaluate(&values))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    check_row_count(&rows, expected)?;
    Ok(rows)
}

/// Changes between successive per-day readings of each patient
///
/// Rows are paired with their predecessor in `(patient_id, measurement_date)`
/// order; pairs spanning two patients are discarded, so patients with a
/// single reading produce nothing.
pub fn compute_deltas(rows: &[AggregatedMeasurement]) -> Result<Vec<MeasurementDelta>> {
    let mut dated: Vec<(PatientId, NaiveDate, i64)> = rows
        .iter()
        .map(|row| {
            row.measurement_date
                .map(|d| (row.patient_id, d, row.agg_value))
                .ok_or_else(|| Error::invalid("change tracking requires per-day aggregates"))
        })
        .collect::<Result<_>>()?;
    dated.sort_by_key(|(patient, date, _)| (*patient, *date));

    dated
        .windows(2)
        .filter(|pair| pair[0].0 == pair[1].0)
        .map(|pair| {
            let (patient_id, prior_date, prior_value) = pair[0];
            let (_, current_date, current_value) = pair[1];
            let value_change = current_value.checked_sub(prior_value).ok_or_else(|| {
                Error::OutOfRange(format!(
                    "change from {} to {} for patient {} overflows",
                    prior_value, current_value, patient_id
                ))
            })?;
            Ok(MeasurementDelta {
                patient_id,
                prior_date,
                prior_value,
                current_date,
                current_value,
                days_between: (current_date - prior_date).num_days(),
                value_change,
            })
        })
        .collect()
}

// ============================================================================
// Engine
// ============================================================================

/// Patients whose readings are aggregated
#[derive(Clone, Debug)]
pub enum MeasurementSubject {
    /// Every reading of these patients
    Patients(Vec<PatientId>),
    /// Readings inside each member's absolute window
    Cohort(Vec<CohortMember>),
    /// Readings within a window around each member's index date
    Indexed {
        members: Vec<IndexedMember>,
        window: RelativeWindow,
    },
}

impl MeasurementSubject {
    fn validate(&self) -> Result<()> {
        let ids: Vec<PatientId> = match self {
            MeasurementSubject::Patients(ids) => {
                for id in ids {
                    PatientId::new(id.get())?;
                }
                return Ok(());
            }
            MeasurementSubject::Cohort(members) => {
                for m in members {
                    if m.end_date < m.start_date {
                        return Err(Error::invalid(format!(
                            "window for patient {} ends ({}) before it starts ({})",
                            m.patient_id, m.end_date, m.start_date
                        )));
                    }
                }
                members.iter().map(|m| m.patient_id).collect()
            }
            MeasurementSubject::Indexed { members, window } => {
                RelativeWindow::new(window.from_days, window.to_days)?;
                members.iter().map(|m| m.patient_id).collect()
            }
        };

        let mut seen = HashSet::new();
        for id in ids {
            PatientId::new(id.get())?;
            if !seen.insert(id) {
                return Err(Error::invalid(format!(
                    "patient {} appears more than once in the cohort",
                    id
                )));
            }
        }
        Ok(())
    }

    fn patient_ids(&self) -> Vec<PatientId> {
        let mut ids: Vec<PatientId> = match self {
            MeasurementSubject::Patients(ids) => ids.clone(),
            MeasurementSubject::Cohort(members) => members.iter().map(|m| m.patient_id).collect(),
            MeasurementSubject::Indexed { members, .. } => {
                members.iter().map(|m| m.patient_id).collect()
            }
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Keep readings whose date lies within `window` of the patient's index date
pub fn filter_relative_window(
    records: Vec<MeasurementRecord>,
    members: &[IndexedMember],
    window: RelativeWindow,
) -> Vec<MeasurementRecord> {
    let index: HashMap<PatientId, NaiveDate> =
        members.iter().map(|m| (m.patient_id, m.index_date)).collect();
    records
        .into_iter()
        .filter(|r| {
            index
                .get(&r.patient_id)
                .is_some_and(|&index_date| window.contains(index_date, r.measurement_date))
        })
        .collect()
}

/// Arguments for [`aggregate_measurements`]
#[derive(Clone, Debug)]
pub struct MeasurementRequest<'a> {
    pub scale: &'a str,
    pub version: &'a str,
    pub subject: &'a MeasurementSubject,
    /// Policy name; unknown names soft-fail with an empty result
    pub policy: &'a str,
    /// Group by patient and day, then emit successive-reading deltas
    pub change_tracking: bool,
    pub include_failed: bool,
    pub dbname: Option<&'a str>,
}

/// Rows returned by [`aggregate_measurements`]
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AggregationOutput {
    Summary(Vec<AggregatedMeasurement>),
    Changes(Vec<MeasurementDelta>),
}

impl AggregationOutput {
    fn empty(change_tracking: bool) -> Self {
        if change_tracking {
            AggregationOutput::Changes(Vec::new())
        } else {
            AggregationOutput::Summary(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AggregationOutput::Summary(rows) => rows.len(),
            AggregationOutput::Changes(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetch and aggregate scale readings
///
/// An unrecognized policy is not an error: it raises
/// [`Diagnostic::UnrecognizedPolicy`] and returns an empty result without
/// touching the source. Argument and version errors are raised before the
/// fetch; fetch errors propagate unchanged.
pub fn aggregate_measurements<S: MeasurementSource + ?Sized>(
    source: &S,
    config: &Config,
    request: &MeasurementRequest<'_>,
) -> Result<Outcome<AggregationOutput>> {
    let mut log = DiagnosticLog::default();

    let policy = match request.policy.parse::<AggregationPolicy>() {
        Ok(policy) => policy,
        Err(_) => {
            log.raise(Diagnostic::UnrecognizedPolicy {
                requested: request.policy.to_string(),
            });
            return Ok(log.finish(AggregationOutput::empty(request.change_tracking)));
        }
    };

    let scale: Scale = request.scale.parse()?;
    request.subject.validate()?;
    let version = config.versions.validate(request.version)?;

    let patients = request.subject.patient_ids();
    if patients.is_empty() {
        log.raise(Diagnostic::EmptyPatientList);
    }

    let scope = match request.subject {
        MeasurementSubject::Cohort(members) => MeasurementScope::Periods(members),
        _ => MeasurementScope::Patients(&patients),
    };
    let query = MeasurementQuery {
        scope,
        scale,
        version,
        include_failed: request.include_failed,
        dbname: request.dbname,
    };
    let mut records = source.fetch_measurements(&query)?;
    tracing::debug!("Fetched {} {} readings", records.len(), scale);

    if let MeasurementSubject::Indexed { members, window } = request.subject {
        records = filter_relative_window(records, members, *window);
        tracing::debug!("{} readings inside window {}", records.len(), window);
    }

    let non_finite = records.iter().filter(|r| !r.value.is_finite()).count();
    if non_finite > 0 {
        log.raise(Diagnostic::NonFiniteValues { count: non_finite });
    }

    if scale.rejects_zero() {
        let zeros = records.iter().filter(|r| r.value == 0.0).count();
        if zeros > 0 {
            log.raise(Diagnostic::ZeroScaleValues {
                scale: scale.to_string(),
                count: zeros,
            });
        }
    }

    let with_records: HashSet<PatientId> = records
        .iter()
        .filter(|r| r.value.is_finite())
        .map(|r| r.patient_id)
        .collect();
    let missing = patients.iter().filter(|p| !with_records.contains(p)).count();
    if missing > 0 {
        log.raise(Diagnostic::PatientsWithoutRecords {
            source: scale.to_string(),
            count: missing,
        });
    }

    let grouping = if request.change_tracking {
        Grouping::PatientDay
    } else {
        Grouping::Patient
    };
    let aggregated = aggregate_records(&records, policy, grouping)?;

    let output = if request.change_tracking {
        AggregationOutput::Changes(compute_deltas(&aggregated)?)
    } else {
        AggregationOutput::Summary(aggregated)
    };

    tracing::info!(
        "Aggregated {} readings into {} rows using {}",
        records.len(),
        output.len(),
        policy
    );
    Ok(log.finish(output))
}
