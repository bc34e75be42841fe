//! In-memory data source, loadable from CSV extracts.
//!
//! Record files are read leniently: malformed rows are logged and skipped.
//! Cohort files are read strictly, since a dropped cohort row would silently
//! remove a patient from every result.

use crate::source::{
    MeasurementQuery, MeasurementScope, MeasurementSource, ObservationSource, VisitQuery,
    VisitSource,
};
use crate::{
    CohortMember, Error, IndexedMember, MeasurementRecord, ObservationPeriod, PatientId, Result,
    Scale, SchemaVersion, VisitRecord,
};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

fn parse_date(raw: &str, column: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|e| Error::Parse(format!("{} '{}': {}", column, raw, e)))
}

fn parse_patient(raw: i64) -> Result<PatientId> {
    PatientId::new(raw).map_err(|e| Error::Parse(e.to_string()))
}

// ============================================================================
// CSV Row Formats
// ============================================================================

#[derive(Debug, Deserialize)]
struct VisitRow {
    person_id: i64,
    visit_start_date: String,
    visit_end_date: String,
    visit_type: String,
    #[serde(default)]
    failed: Option<bool>,
}

impl TryFrom<VisitRow> for StoredVisit {
    type Error = Error;

    fn try_from(row: VisitRow) -> Result<Self> {
        let record = VisitRecord::new(
            parse_patient(row.person_id)?,
            parse_date(&row.visit_start_date, "visit_start_date")?,
            parse_date(&row.visit_end_date, "visit_end_date")?,
            row.visit_type,
        )
        .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(StoredVisit {
            record,
            failed: row.failed.unwrap_or(false),
        })
    }
}

#[derive(Debug, Deserialize)]
struct MeasurementRow {
    person_id: i64,
    scale: String,
    measurement_date: String,
    value: f64,
    #[serde(default)]
    failed: Option<bool>,
}

impl TryFrom<MeasurementRow> for StoredMeasurement {
    type Error = Error;

    fn try_from(row: MeasurementRow) -> Result<Self> {
        let scale = row
            .scale
            .parse::<Scale>()
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(StoredMeasurement {
            scale,
            record: MeasurementRecord {
                patient_id: parse_patient(row.person_id)?,
                measurement_date: parse_date(&row.measurement_date, "measurement_date")?,
                value: row.value,
            },
            failed: row.failed.unwrap_or(false),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ObservationRow {
    person_id: i64,
    observation_period_start_date: String,
    observation_period_end_date: String,
}

impl TryFrom<ObservationRow> for ObservationPeriod {
    type Error = Error;

    fn try_from(row: ObservationRow) -> Result<Self> {
        Ok(ObservationPeriod {
            patient_id: parse_patient(row.person_id)?,
            start_date: parse_date(
                &row.observation_period_start_date,
                "observation_period_start_date",
            )?,
            end_date: parse_date(
                &row.observation_period_end_date,
                "observation_period_end_date",
            )?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CohortRow {
    person_id: i64,
    start_date: String,
    end_date: String,
}

#[derive(Debug, Deserialize)]
struct IndexedRow {
    person_id: i64,
    index_date: String,
}

/// Read every row, logging and skipping the ones that fail to convert
fn read_lenient<R, T>(path: &Path) -> Result<Vec<T>>
where
    R: DeserializeOwned,
    T: TryFrom<R, Error = Error>,
{
    let mut reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_path(path)?;

    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<R>().enumerate() {
        match result {
            Ok(raw) => match T::try_from(raw) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!("Skipping row {} of {:?}: {}", line + 2, path, e),
            },
            Err(e) => tracing::warn!("Failed to deserialize row {} of {:?}: {}", line + 2, path, e),
        }
    }

    tracing::debug!("Loaded {} rows from {:?}", rows.len(), path);
    Ok(rows)
}

/// Load a cohort with absolute windows (`person_id,start_date,end_date`)
///
/// Extra columns such as `cohort_id` are ignored.
pub fn load_cohort_csv(path: &Path) -> Result<Vec<CohortMember>> {
    let mut reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_path(path)?;

    let mut members = Vec::new();
    for result in reader.deserialize::<CohortRow>() {
        let row = result?;
        let member = CohortMember::new(
            parse_patient(row.person_id)?,
            parse_date(&row.start_date, "start_date")?,
            parse_date(&row.end_date, "end_date")?,
        );
        members.push(member);
    }
    Ok(members)
}

/// Load a cohort anchored on index dates (`person_id,index_date`)
pub fn load_indexed_cohort_csv(path: &Path) -> Result<Vec<IndexedMember>> {
    let mut reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_path(path)?;

    let mut members = Vec::new();
    for result in reader.deserialize::<IndexedRow>() {
        let row = result?;
        members.push(IndexedMember {
            patient_id: parse_patient(row.person_id)?,
            index_date: parse_date(&row.index_date, "index_date")?,
        });
    }
    Ok(members)
}

// ============================================================================
// Memory Store
// ============================================================================

/// A visit row plus its failed-encounter flag
#[derive(Clone, Debug)]
pub struct StoredVisit {
    pub record: VisitRecord,
    pub failed: bool,
}

/// A scale reading plus the scale it belongs to
#[derive(Clone, Debug)]
pub struct StoredMeasurement {
    pub scale: Scale,
    pub record: MeasurementRecord,
    pub failed: bool,
}

/// Holds extracted rows and answers queries against them
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    visits: Vec<StoredVisit>,
    measurements: Vec<StoredMeasurement>,
    observation_periods: Vec<ObservationPeriod>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_visit(&mut self, record: VisitRecord, failed: bool) -> &mut Self {
        self.visits.push(StoredVisit { record, failed });
        self
    }

    pub fn add_measurement(
        &mut self,
        scale: Scale,
        record: MeasurementRecord,
        failed: bool,
    ) -> &mut Self {
        self.measurements.push(StoredMeasurement { scale, record, failed });
        self
    }

    pub fn add_observation_period(&mut self, period: ObservationPeriod) -> &mut Self {
        self.observation_periods.push(period);
        self
    }

    /// Append visits from `person_id,visit_start_date,visit_end_date,visit_type[,failed]`
    pub fn load_visits_csv(&mut self, path: &Path) -> Result<usize> {
        let rows: Vec<StoredVisit> = read_lenient::<VisitRow, _>(path)?;
        let count = rows.len();
        self.visits.extend(rows);
        Ok(count)
    }

    /// Append readings from `person_id,scale,measurement_date,value[,failed]`
    pub fn load_measurements_csv(&mut self, path: &Path) -> Result<usize> {
        let rows: Vec<StoredMeasurement> = read_lenient::<MeasurementRow, _>(path)?;
        let count = rows.len();
        self.measurements.extend(rows);
        Ok(count)
    }

    /// Append periods from `person_id,observation_period_start_date,observation_period_end_date`
    pub fn load_observation_periods_csv(&mut self, path: &Path) -> Result<usize> {
        let rows: Vec<ObservationPeriod> = read_lenient::<ObservationRow, _>(path)?;
        let count = rows.len();
        self.observation_periods.extend(rows);
        Ok(count)
    }
}

impl VisitSource for MemoryStore {
    fn fetch_visits(&self, query: &VisitQuery<'_>) -> Result<Vec<VisitRecord>> {
        let periods: HashMap<PatientId, &CohortMember> =
            query.periods.iter().map(|p| (p.patient_id, p)).collect();
        let wanted: Vec<String> = query.visit_types.iter().map(|t| t.to_lowercase()).collect();

        let rows: Vec<VisitRecord> = self
            .visits
            .iter()
            .filter(|v| query.include_failed || !v.failed)
            .filter(|v| wanted.contains(&v.record.visit_type.to_lowercase()))
            .filter(|v| {
                periods
                    .get(&v.record.patient_id)
                    .is_some_and(|period| period.contains(v.record.visit_start))
            })
            .map(|v| v.record.clone())
            .collect();

        tracing::debug!(
            "Fetched {} visit rows of {:?} from {}",
            rows.len(),
            query.visit_types,
            query.version.cdt
        );
        Ok(rows)
    }
}

impl MeasurementSource for MemoryStore {
    fn fetch_measurements(&self, query: &MeasurementQuery<'_>) -> Result<Vec<MeasurementRecord>> {
        let in_scope: Box<dyn Fn(&MeasurementRecord) -> bool + '_> = match query.scope {
            MeasurementScope::Patients(ids) => {
                let ids: HashSet<PatientId> = ids.iter().copied().collect();
                Box::new(move |r| ids.contains(&r.patient_id))
            }
            MeasurementScope::Periods(members) => {
                let periods: HashMap<PatientId, &CohortMember> =
                    members.iter().map(|m| (m.patient_id, m)).collect();
                Box::new(move |r| {
                    periods
                        .get(&r.patient_id)
                        .is_some_and(|period| period.contains(r.measurement_date))
                })
            }
        };

        let rows: Vec<MeasurementRecord> = self
            .measurements
            .iter()
            .filter(|m| m.scale == query.scale)
            .filter(|m| query.include_failed || !m.failed)
            .filter(|m| in_scope(&m.record))
            .map(|m| m.record.clone())
            .collect();

        tracing::debug!(
            "Fetched {} {} readings from {}",
            rows.len(),
            query.scale,
            query.dbname.unwrap_or(&query.version.cdt)
        );
        Ok(rows)
    }
}

impl ObservationSource for MemoryStore {
    fn fetch_observation_periods(
        &self,
        patients: &[PatientId],
        _version: &SchemaVersion,
    ) -> Result<Vec<ObservationPeriod>> {
        let wanted: HashSet<PatientId> = patients.iter().copied().collect();
        Ok(self
            .observation_periods
            .iter()
            .filter(|p| wanted.contains(&p.patient_id))
            .cloned()
            .collect())
    }
}
