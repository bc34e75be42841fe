//! Visit consolidation engine.
//!
//! Turns raw visit rows into per-patient encounter counts for each
//! utilization label:
//! - Fetch rows for the label's source visit types
//! - In the windowed form, drop row-level duplicates (same start, same end,
//!   or a start nested inside another row)
//! - Merge overlapping rows into encounters (a stay and a visit nested in it
//!   count once)
//! - Count distinct encounter start dates per patient, zero-filling the cohort

use crate::diagnostics::DiagnosticLog;
use crate::source::{VisitQuery, VisitSource};
use crate::{
    CohortMember, Config, ConsolidatedVisitCount, Diagnostic, Error, IndexedMember, Outcome,
    PatientId, RelativeWindow, Result, VisitRecord,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

// ============================================================================
// Label Map
// ============================================================================

/// Output label and the source visit types merged under it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtilizationLabel {
    pub name: String,
    pub visit_types: Vec<String>,
}

impl UtilizationLabel {
    pub fn new<T: Into<String>>(
        name: impl Into<String>,
        visit_types: impl IntoIterator<Item = T>,
    ) -> Self {
        Self {
            name: name.into(),
            visit_types: visit_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Parses `NAME=TYPE[;TYPE...]`, e.g. `acute=Inpatient Visit;Emergency Room Visit`
impl FromStr for UtilizationLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, types) = s
            .split_once('=')
            .ok_or_else(|| {
                Error::invalid(format!("label '{}' must look like NAME=TYPE[;TYPE...]", s))
            })?;
        Ok(UtilizationLabel::new(
            name.trim(),
            types.split(';').map(str::trim).filter(|t| !t.is_empty()),
        ))
    }
}

/// Visit categories of the default label map
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardVisit {
    Outpatient,
    Inpatient,
    EmergencyRoom,
}

impl StandardVisit {
    pub const ALL: [StandardVisit; 3] = [
        StandardVisit::Outpatient,
        StandardVisit::Inpatient,
        StandardVisit::EmergencyRoom,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StandardVisit::Outpatient => "OP",
            StandardVisit::Inpatient => "IP",
            StandardVisit::EmergencyRoom => "ED",
        }
    }

    pub fn source_type(self) -> &'static str {
        match self {
            StandardVisit::Outpatient => "Outpatient Visit",
            StandardVisit::Inpatient => "Inpatient Visit",
            StandardVisit::EmergencyRoom => "Emergency Room Visit",
        }
    }
}

/// Validated, ordered set of utilization labels
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitLabelMap {
    labels: Vec<UtilizationLabel>,
}

impl VisitLabelMap {
    /// Validate a label map
    ///
    /// Every label needs a unique non-empty name and at least one non-empty
    /// visit type.
    pub fn new(labels: Vec<UtilizationLabel>) -> Result<Self> {
        if labels.is_empty() {
            return Err(Error::invalid("visit label map must contain at least one label"));
        }

        let mut seen = HashSet::new();
        for label in &labels {
            if label.name.trim().is_empty() {
                return Err(Error::invalid("visit label names must be non-empty strings"));
            }
            if !seen.insert(label.name.as_str()) {
                return Err(Error::invalid(format!(
                    "visit label '{}' is defined twice",
                    label.name
                )));
            }
            if label.visit_types.is_empty() {
                return Err(Error::invalid(format!(
                    "visit label '{}' must map to a non-empty list of visit types",
                    label.name
                )));
            }
            if label.visit_types.iter().any(|t| t.trim().is_empty()) {
                return Err(Error::invalid(format!(
                    "visit label '{}' contains an empty visit type",
                    label.name
                )));
            }
        }

        Ok(Self { labels })
    }

    /// One-to-one OP / IP / ED map
    pub fn standard() -> Self {
        Self {
            labels: StandardVisit::ALL
                .iter()
                .map(|v| UtilizationLabel::new(v.label(), [v.source_type()]))
                .collect(),
        }
    }

    pub fn labels(&self) -> &[UtilizationLabel] {
        &self.labels
    }

    pub fn names(&self) -> Vec<&str> {
        self.labels.iter().map(|l| l.name.as_str()).collect()
    }
}

// ============================================================================
// Request
// ============================================================================

/// How each patient's observation window is given
#[derive(Clone, Debug)]
pub enum VisitCohort {
    /// Absolute `[start_date, end_date]` per patient
    Batch(Vec<CohortMember>),
    /// Day offsets from each patient's index date
    Windowed {
        members: Vec<IndexedMember>,
        window: RelativeWindow,
    },
}

impl VisitCohort {
    /// Absolute windows, rejecting inverted and duplicate entries
    fn resolve(&self) -> Result<Vec<CohortMember>> {
        let periods: Vec<CohortMember> = match self {
            VisitCohort::Batch(members) => members.clone(),
            VisitCohort::Windowed { members, window } => {
                RelativeWindow::new(window.from_days, window.to_days)?;
                members
                    .iter()
                    .map(|m| window.resolve(m))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let mut seen = HashSet::new();
        for period in &periods {
            if period.end_date < period.start_date {
                return Err(Error::invalid(format!(
                    "window for patient {} ends ({}) before it starts ({})",
                    period.patient_id, period.end_date, period.start_date
                )));
            }
            if !seen.insert(period.patient_id) {
                return Err(Error::invalid(format!(
                    "patient {} appears more than once in the cohort",
                    period.patient_id
                )));
            }
        }

        Ok(periods)
    }

    fn is_windowed(&self) -> bool {
        matches!(self, VisitCohort::Windowed { .. })
    }
}

/// Arguments for [`consolidate_visit_utilization`]
#[derive(Clone, Debug)]
pub struct UtilizationRequest<'a> {
    pub cohort: &'a VisitCohort,
    pub version: &'a str,
    /// Falls back to the configured label map
    pub labels: Option<&'a VisitLabelMap>,
    /// Falls back to `visits.include_failed`
    pub include_failed: Option<bool>,
}

// ============================================================================
// Encounter Merging
// ============================================================================

/// A real-world encounter built from one or more visit rows
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Encounter {
    pub patient_id: PatientId,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl From<&VisitRecord> for Encounter {
    fn from(row: &VisitRecord) -> Self {
        Encounter {
            patient_id: row.patient_id,
            start: row.visit_start,
            end: row.visit_end,
        }
    }
}

/// Merge each patient's overlapping spans into maximal encounters
///
/// Spans sharing at least one calendar day belong to the same encounter, and
/// the merge is transitive. Output is sorted by `(patient_id, start)`.
pub fn merge_overlapping(spans: &[Encounter]) -> Vec<Encounter> {
    let mut spans = spans.to_vec();
    spans.sort();

    let mut merged: Vec<Encounter> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(current)
                if current.patient_id == span.patient_id && span.start <= current.end =>
            {
                current.end = current.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Drop row-level spans that duplicate one already kept for the same patient
///
/// Runs on raw rows, before [`merge_overlapping`], so a dropped row can no
/// longer bridge two otherwise separate encounters. After sorting by
/// `(patient_id, start, end)`, a span is dropped when it shares its start or
/// its end with a kept one, or when its start lies strictly inside a kept
/// one's range. Ties keep the earliest-starting, then earliest-ending, span.
pub fn resolve_cross_duplicates(encounters: &[Encounter]) -> Vec<Encounter> {
    let mut sorted = encounters.to_vec();
    sorted.sort();

    let mut kept: Vec<Encounter> = Vec::with_capacity(sorted.len());
    let mut patient_from = 0;
    for encounter in sorted {
        if kept
            .get(patient_from)
            .is_some_and(|first| first.patient_id != encounter.patient_id)
        {
            patient_from = kept.len();
        }

        let duplicate = kept[patient_from..].iter().any(|k| {
            k.start == encounter.start
                || k.end == encounter.end
                || (k.start < encounter.start && encounter.start < k.end)
        });
        if !duplicate {
            kept.push(encounter);
        }
    }
    kept
}

/// Distinct encounter start dates per patient
pub fn count_encounters(encounters: &[Encounter]) -> HashMap<PatientId, u32> {
    let mut starts: HashMap<PatientId, HashSet<NaiveDate>> = HashMap::new();
    for e in encounters {
        starts.entry(e.patient_id).or_default().insert(e.start);
    }
    starts
        .into_iter()
        .map(|(patient, dates)| (patient, dates.len() as u32))
        .collect()
}

// ============================================================================
// Engine
// ============================================================================

/// Count distinct encounters per patient for every utilization label
///
/// Returns exactly one row per cohort member, in cohort order; patients
/// without qualifying visits get a count of zero. Argument and version
/// errors are raised before the source is queried. Fetch errors propagate
/// unchanged.
pub fn consolidate_visit_utilization<S: VisitSource + ?Sized>(
    source: &S,
    config: &Config,
    request: &UtilizationRequest<'_>,
) -> Result<Outcome<Vec<ConsolidatedVisitCount>>> {
    let labels = match request.labels {
        Some(map) => VisitLabelMap::new(map.labels().to_vec())?,
        None => config.label_map()?,
    };
    let periods = request.cohort.resolve()?;
    let version = config.versions.validate(request.version)?;
    let include_failed = request.include_failed.unwrap_or(config.visits.include_failed);
    let windowed = request.cohort.is_windowed();

    let mut log = DiagnosticLog::default();
    if periods.is_empty() {
        log.raise(Diagnostic::EmptyPatientList);
    }

    let mut label_counts: Vec<HashMap<PatientId, u32>> =
        Vec::with_capacity(labels.labels().len());
    for label in labels.labels() {
        let query = VisitQuery {
            periods: &periods,
            visit_types: &label.visit_types,
            version,
            include_failed,
        };
        let rows = source.fetch_visits(&query)?;

        let mut spans: Vec<Encounter> = rows.iter().map(Encounter::from).collect();
        if windowed {
            spans = resolve_cross_duplicates(&spans);
        }
        let encounters = merge_overlapping(&spans);
        tracing::debug!(
            "{}: {} visit rows consolidated into {} encounters",
            label.name,
            rows.len(),
            encounters.len()
        );

        label_counts.push(count_encounters(&encounters));
    }

    let results: Vec<ConsolidatedVisitCount> = periods
        .iter()
        .map(|period| ConsolidatedVisitCount {
            patient_id: period.patient_id,
            period_days: period.period_days(),
            counts: labels
                .labels()
                .iter()
                .zip(&label_counts)
                .map(|(label, counts)| {
                    (label.name.clone(), counts.get(&period.patient_id).copied().unwrap_or(0))
                })
                .collect(),
        })
        .collect();

    let without_visits = results
        .iter()
        .filter(|row| row.counts.iter().all(|(_, count)| *count == 0))
        .count();
    if without_visits > 0 {
        log.raise(Diagnostic::PatientsWithoutRecords {
            source: "visit".into(),
            count: without_visits,
        });
    }

    for label in labels.labels() {
        let over: Vec<PatientId> = results
            .iter()
            .filter(|row| row.count(&label.name).unwrap_or(0) as i64 > row.period_days)
            .map(|row| row.patient_id)
            .collect();
        if !over.is_empty() {
            log.raise(Diagnostic::UtilizationExceedsPeriod {
                label: label.name.clone(),
                patients: over,
            });
        }
    }

    tracing::info!(
        "Consolidated visit utilization for {} patients across {} labels",
        results.len(),
        label_counts.len()
    );
    Ok(log.finish(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::cell::Cell;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn visit(patient: i64, start: NaiveDate, end: NaiveDate, kind: &str) -> VisitRecord {
        VisitRecord::new(PatientId(patient), start, end, kind).unwrap()
    }

    fn encounter(patient: i64, start: NaiveDate, end: NaiveDate) -> Encounter {
        Encounter {
            patient_id: PatientId(patient),
            start,
            end,
        }
    }

    fn spans(rows: &[VisitRecord]) -> Vec<Encounter> {
        rows.iter().map(Encounter::from).collect()
    }

    fn january_cohort(ids: &[i64]) -> VisitCohort {
        VisitCohort::Batch(
            ids.iter()
                .map(|&id| CohortMember::new(PatientId(id), date(2023, 1, 1), date(2023, 1, 31)))
                .collect(),
        )
    }

    fn acute_labels() -> VisitLabelMap {
        VisitLabelMap::new(vec![UtilizationLabel::new(
            "acute",
            ["Inpatient Visit", "Emergency Room Visit"],
        )])
        .unwrap()
    }

    fn request<'a>(
        cohort: &'a VisitCohort,
        labels: Option<&'a VisitLabelMap>,
    ) -> UtilizationRequest<'a> {
        UtilizationRequest {
            cohort,
            version: "rel_23r1",
            labels,
            include_failed: None,
        }
    }

    fn run<S: VisitSource>(
        source: &S,
        cohort: &VisitCohort,
        labels: Option<&VisitLabelMap>,
    ) -> Result<Outcome<Vec<ConsolidatedVisitCount>>> {
        consolidate_visit_utilization(source, &Config::default(), &request(cohort, labels))
    }

    /// Source that counts calls and then fails
    struct FailingSource {
        calls: Cell<usize>,
    }

    impl FailingSource {
        fn new() -> Self {
            FailingSource {
                calls: Cell::new(0),
            }
        }
    }

    impl VisitSource for FailingSource {
        fn fetch_visits(&self, _query: &VisitQuery<'_>) -> Result<Vec<VisitRecord>> {
            self.calls.set(self.calls.get() + 1);
            Err(Error::Fetch("connection refused".into()))
        }
    }

    #[test]
    fn test_merge_nested_visit_collapses() {
        let rows = vec![
            visit(1, date(2023, 1, 1), date(2023, 1, 5), "A"),
            visit(1, date(2023, 1, 3), date(2023, 1, 3), "B"),
        ];
        let merged = merge_overlapping(&spans(&rows));
        assert_eq!(merged, vec![encounter(1, date(2023, 1, 1), date(2023, 1, 5))]);
    }

    #[test]
    fn test_merge_is_transitive_and_per_patient() {
        let rows = vec![
            visit(1, date(2023, 1, 4), date(2023, 1, 8), "A"),
            visit(1, date(2023, 1, 1), date(2023, 1, 4), "A"),
            visit(1, date(2023, 1, 8), date(2023, 1, 10), "A"),
            visit(2, date(2023, 1, 2), date(2023, 1, 3), "A"),
        ];
        let merged = merge_overlapping(&spans(&rows));
        assert_eq!(
            merged,
            vec![
                encounter(1, date(2023, 1, 1), date(2023, 1, 10)),
                encounter(2, date(2023, 1, 2), date(2023, 1, 3)),
            ]
        );
    }

    #[test]
    fn test_consecutive_days_stay_separate() {
        let rows = vec![
            visit(1, date(2023, 1, 1), date(2023, 1, 1), "A"),
            visit(1, date(2023, 1, 2), date(2023, 1, 2), "A"),
        ];
        assert_eq!(merge_overlapping(&spans(&rows)).len(), 2);
    }

    #[test]
    fn test_merge_reduces_injected_overlaps() {
        let mut rows: Vec<VisitRecord> = (1..=10)
            .map(|d| visit(1, date(2023, 1, d * 2), date(2023, 1, d * 2), "A"))
            .collect();
        assert_eq!(merge_overlapping(&spans(&rows)).len(), rows.len());

        rows.push(visit(1, date(2023, 1, 2), date(2023, 1, 6), "B"));
        let merged = merge_overlapping(&spans(&rows));
        assert!(merged.len() < rows.len());
        assert_eq!(merged.len(), 8);
    }

    #[test]
    fn test_cross_duplicates_shared_start_or_end() {
        let encounters = vec![
            encounter(1, date(2023, 1, 1), date(2023, 1, 3)),
            encounter(1, date(2023, 1, 1), date(2023, 1, 5)),
            encounter(1, date(2023, 1, 2), date(2023, 1, 3)),
            encounter(1, date(2023, 1, 10), date(2023, 1, 10)),
        ];
        let kept = resolve_cross_duplicates(&encounters);
        assert_eq!(
            kept,
            vec![
                encounter(1, date(2023, 1, 1), date(2023, 1, 3)),
                encounter(1, date(2023, 1, 10), date(2023, 1, 10)),
            ]
        );
    }

    #[test]
    fn test_cross_duplicates_contained_start() {
        let encounters = vec![
            encounter(1, date(2023, 1, 4), date(2023, 1, 9)),
            encounter(1, date(2023, 1, 1), date(2023, 1, 6)),
            encounter(2, date(2023, 1, 4), date(2023, 1, 4)),
        ];
        let kept = resolve_cross_duplicates(&encounters);
        assert_eq!(
            kept,
            vec![
                encounter(1, date(2023, 1, 1), date(2023, 1, 6)),
                encounter(2, date(2023, 1, 4), date(2023, 1, 4)),
            ]
        );
    }

    #[test]
    fn test_count_distinct_starts() {
        let encounters = vec![
            encounter(1, date(2023, 1, 1), date(2023, 1, 1)),
            encounter(1, date(2023, 1, 1), date(2023, 1, 2)),
            encounter(1, date(2023, 1, 5), date(2023, 1, 5)),
            encounter(3, date(2023, 1, 5), date(2023, 1, 5)),
        ];
        let counts = count_encounters(&encounters);
        assert_eq!(counts[&PatientId(1)], 2);
        assert_eq!(counts[&PatientId(3)], 1);
        assert!(!counts.contains_key(&PatientId(2)));
    }

    #[test]
    fn test_label_map_validation() {
        let no_types = UtilizationLabel::new("OP", Vec::<String>::new());
        assert!(VisitLabelMap::new(vec![]).is_err());
        assert!(VisitLabelMap::new(vec![no_types]).is_err());
        assert!(VisitLabelMap::new(vec![UtilizationLabel::new("", ["Outpatient Visit"])]).is_err());
        assert!(VisitLabelMap::new(vec![UtilizationLabel::new("OP", [" "])]).is_err());
        assert!(VisitLabelMap::new(vec![
            UtilizationLabel::new("OP", ["Outpatient Visit"]),
            UtilizationLabel::new("OP", ["Office Visit"]),
        ])
        .is_err());

        assert_eq!(acute_labels().names(), vec!["acute"]);
        assert_eq!(VisitLabelMap::standard().names(), vec!["OP", "IP", "ED"]);
    }

    #[test]
    fn test_label_from_str() {
        let label: UtilizationLabel =
            "acute=Inpatient Visit; Emergency Room Visit".parse().unwrap();
        assert_eq!(label.name, "acute");
        assert_eq!(label.visit_types, vec!["Inpatient Visit", "Emergency Room Visit"]);
        assert!("acute".parse::<UtilizationLabel>().is_err());
    }

    #[test]
    fn test_one_row_per_patient_with_zero_fill() {
        let mut store = MemoryStore::new();
        store.add_visit(visit(1, date(2023, 1, 3), date(2023, 1, 3), "Outpatient Visit"), false);

        let cohort = january_cohort(&[1, 2, 3]);
        let outcome = run(&store, &cohort, None).unwrap();

        let rows = outcome.rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].count("OP"), Some(1));
        assert_eq!(rows[0].count("IP"), Some(0));
        assert_eq!(rows[1].patient_id, PatientId(2));
        assert_eq!(rows[1].count("OP"), Some(0));
        assert_eq!(rows[2].count("ED"), Some(0));
        assert!(rows.iter().all(|r| r.period_days == 31));
    }

    #[test]
    fn test_patients_without_visits_reported() {
        let mut store = MemoryStore::new();
        store.add_visit(visit(1, date(2023, 1, 3), date(2023, 1, 3), "Outpatient Visit"), false);

        let cohort = january_cohort(&[1, 2, 3]);
        let outcome = run(&store, &cohort, None).unwrap();

        assert_eq!(
            outcome.diagnostics,
            vec![Diagnostic::PatientsWithoutRecords {
                source: "visit".into(),
                count: 2,
            }]
        );
    }

    #[test]
    fn test_merged_label_counts_nested_visit_once() {
        let mut store = MemoryStore::new();
        store
            .add_visit(visit(1, date(2023, 1, 1), date(2023, 1, 5), "A"), false)
            .add_visit(visit(1, date(2023, 1, 3), date(2023, 1, 3), "B"), false);

        let labels = VisitLabelMap::new(vec![UtilizationLabel::new("AB", ["A", "B"])]).unwrap();
        let cohort = january_cohort(&[1]);
        let outcome = run(&store, &cohort, Some(&labels)).unwrap();

        assert_eq!(outcome.rows[0].count("AB"), Some(1));
    }

    #[test]
    fn test_counts_never_exceed_period() {
        let mut store = MemoryStore::new();
        for day in 1..=31 {
            let row = visit(1, date(2023, 1, day), date(2023, 1, day), "Outpatient Visit");
            store.add_visit(row, false);
        }

        let cohort = january_cohort(&[1]);
        let outcome = run(&store, &cohort, None).unwrap();

        let row = &outcome.rows[0];
        assert_eq!(row.count("OP"), Some(31));
        assert!(row.count("OP").unwrap() as i64 <= row.period_days);
        assert!(!outcome.has_diagnostics());
    }

    #[test]
    fn test_excess_utilization_raises_diagnostic() {
        /// Ignores the cohort window when fetching
        struct Unfiltered(Vec<VisitRecord>);

        impl VisitSource for Unfiltered {
            fn fetch_visits(&self, _query: &VisitQuery<'_>) -> Result<Vec<VisitRecord>> {
                Ok(self.0.clone())
            }
        }

        let rows = (1..=5)
            .map(|d| visit(1, date(2023, 2, d), date(2023, 2, d), "Outpatient Visit"))
            .collect();
        let cohort = VisitCohort::Batch(vec![CohortMember::new(
            PatientId(1),
            date(2023, 1, 1),
            date(2023, 1, 3),
        )]);
        let labels =
            VisitLabelMap::new(vec![UtilizationLabel::new("OP", ["Outpatient Visit"])]).unwrap();

        let outcome = run(&Unfiltered(rows), &cohort, Some(&labels)).unwrap();

        assert_eq!(outcome.rows[0].count("OP"), Some(5));
        assert_eq!(
            outcome.diagnostics,
            vec![Diagnostic::UtilizationExceedsPeriod {
                label: "OP".into(),
                patients: vec![PatientId(1)],
            }]
        );
    }

    #[test]
    fn test_windowed_form_resolves_relative_periods() {
        let mut store = MemoryStore::new();
        store
            .add_visit(visit(1, date(2023, 1, 5), date(2023, 1, 8), "Inpatient Visit"), false)
            .add_visit(visit(1, date(2023, 1, 5), date(2023, 1, 5), "Emergency Room Visit"), false)
            .add_visit(visit(1, date(2023, 3, 1), date(2023, 3, 1), "Inpatient Visit"), false);

        let cohort = VisitCohort::Windowed {
            members: vec![IndexedMember {
                patient_id: PatientId(1),
                index_date: date(2023, 1, 10),
            }],
            window: RelativeWindow::new(-30, 0).unwrap(),
        };

        let outcome = run(&store, &cohort, Some(&acute_labels())).unwrap();
        assert_eq!(outcome.rows[0].period_days, 31);
        assert_eq!(outcome.rows[0].count("acute"), Some(1));
    }

    #[test]
    fn test_windowed_duplicate_row_cannot_bridge_encounters() {
        // The ER row starts inside the stay; dropped, it no longer links the
        // stay to the later admission.
        let mut store = MemoryStore::new();
        store
            .add_visit(visit(1, date(2023, 1, 1), date(2023, 1, 3), "Inpatient Visit"), false)
            .add_visit(visit(1, date(2023, 1, 2), date(2023, 1, 10), "Emergency Room Visit"), false)
            .add_visit(visit(1, date(2023, 1, 8), date(2023, 1, 9), "Inpatient Visit"), false);
        let labels = acute_labels();

        let batch = run(&store, &january_cohort(&[1]), Some(&labels)).unwrap();
        assert_eq!(batch.rows[0].count("acute"), Some(1));

        let windowed = VisitCohort::Windowed {
            members: vec![IndexedMember {
                patient_id: PatientId(1),
                index_date: date(2023, 1, 15),
            }],
            window: RelativeWindow::new(-30, 0).unwrap(),
        };
        let outcome = run(&store, &windowed, Some(&labels)).unwrap();
        assert_eq!(outcome.rows[0].count("acute"), Some(2));
    }

    #[test]
    fn test_window_overflow_is_an_argument_error() {
        let source = FailingSource::new();
        let cohort = VisitCohort::Windowed {
            members: vec![IndexedMember {
                patient_id: PatientId(1),
                index_date: date(2023, 1, 10),
            }],
            window: RelativeWindow::new(-1_000_000_000, 0).unwrap(),
        };

        let err = run(&source, &cohort, None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_failed_encounters_excluded_on_request() {
        let mut store = MemoryStore::new();
        store
            .add_visit(visit(1, date(2023, 1, 2), date(2023, 1, 2), "Outpatient Visit"), false)
            .add_visit(visit(1, date(2023, 1, 9), date(2023, 1, 9), "Outpatient Visit"), true);

        let cohort = january_cohort(&[1]);
        let mut req = request(&cohort, None);
        let with_failed = consolidate_visit_utilization(&store, &Config::default(), &req).unwrap();
        assert_eq!(with_failed.rows[0].count("OP"), Some(2));

        req.include_failed = Some(false);
        let without = consolidate_visit_utilization(&store, &Config::default(), &req).unwrap();
        assert_eq!(without.rows[0].count("OP"), Some(1));
    }

    #[test]
    fn test_argument_errors_raised_before_fetch() {
        let source = FailingSource::new();

        let bad_labels = VisitLabelMap {
            labels: vec![UtilizationLabel::new("OP", Vec::<String>::new())],
        };
        let cohort = january_cohort(&[1]);
        let err = run(&source, &cohort, Some(&bad_labels)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = run(&source, &january_cohort(&[1, 1]), None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut req = request(&cohort, None);
        req.version = "r99";
        let err = consolidate_visit_utilization(&source, &Config::default(), &req).unwrap_err();
        assert!(matches!(err, Error::Version { .. }));

        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_fetch_errors_propagate_unchanged() {
        let source = FailingSource::new();
        let cohort = january_cohort(&[1]);

        let err = run(&source, &cohort, None).unwrap_err();
        assert!(matches!(err, Error::Fetch(ref msg) if msg == "connection refused"));
        assert_eq!(source.calls.get(), 1);
    }

    #[test]
    fn test_empty_cohort_reports_diagnostic() {
        let store = MemoryStore::new();
        let cohort = VisitCohort::Batch(vec![]);
        let outcome = run(&store, &cohort, None).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.diagnostics, vec![Diagnostic::EmptyPatientList]);
    }
}
