//! Days of recorded data available around each patient's index date.

use crate::diagnostics::DiagnosticLog;
use crate::source::ObservationSource;
use crate::{
    Config, DaysAvailable, Diagnostic, Error, IndexedMember, ObservationPeriod, Outcome, PatientId,
    Result,
};
use std::collections::{HashMap, HashSet};

/// Observation coverage before and after each member's index date
///
/// Each member is joined with every observation period recorded for them,
/// so a patient with several periods yields several rows. Members without a
/// recorded period are dropped from the result and reported. Index dates
/// outside a period produce negative day counts and a diagnostic, not an
/// error.
pub fn days_available<S: ObservationSource + ?Sized>(
    source: &S,
    config: &Config,
    members: &[IndexedMember],
    version: &str,
) -> Result<Outcome<Vec<DaysAvailable>>> {
    let mut seen = HashSet::new();
    for member in members {
        PatientId::new(member.patient_id.get())?;
        if !seen.insert(member.patient_id) {
            return Err(Error::invalid(format!(
                "patient {} appears more than once in the cohort",
                member.patient_id
            )));
        }
    }
    let schema = config.versions.validate(version)?;

    let mut log = DiagnosticLog::default();
    if members.is_empty() {
        log.raise(Diagnostic::EmptyPatientList);
    }

    let patients: Vec<PatientId> = members.iter().map(|m| m.patient_id).collect();
    let mut periods: HashMap<PatientId, Vec<ObservationPeriod>> = HashMap::new();
    for period in source.fetch_observation_periods(&patients, schema)? {
        periods.entry(period.patient_id).or_default().push(period);
    }
    for recorded in periods.values_mut() {
        recorded.sort_by_key(|p| (p.start_date, p.end_date));
    }

    // One row per (member, period) pair
    let rows: Vec<DaysAvailable> = members
        .iter()
        .flat_map(|member| {
            let recorded = periods.get(&member.patient_id).map(Vec::as_slice).unwrap_or_default();
            recorded.iter().map(move |period| DaysAvailable {
                patient_id: member.patient_id,
                index_date: member.index_date,
                observation_start: period.start_date,
                observation_end: period.end_date,
                pre_index_days: (member.index_date - period.start_date).num_days(),
                post_index_days: (period.end_date - member.index_date).num_days(),
            })
        })
        .collect();

    let missing = members
        .iter()
        .filter(|m| !periods.contains_key(&m.patient_id))
        .count();
    if missing > 0 {
        log.raise(Diagnostic::PatientsWithoutRecords {
            source: "observation period".into(),
            count: missing,
        });
    }

    let before = patients_where(&rows, |r| r.index_date < r.observation_start);
    if !before.is_empty() {
        log.raise(Diagnostic::IndexBeforeObservation { patients: before });
    }

    let after = patients_where(&rows, |r| r.observation_end < r.index_date);
    if !after.is_empty() {
        log.raise(Diagnostic::IndexAfterObservation { patients: after });
    }

    tracing::info!("Computed days available for {} patients", rows.len());
    Ok(log.finish(rows))
}

/// Patients with at least one row matching `pred`, in first-seen order
fn patients_where<F>(rows: &[DaysAvailable], pred: F) -> Vec<PatientId>
where
    F: Fn(&DaysAvailable) -> bool,
{
    let mut patients: Vec<PatientId> = Vec::new();
    for row in rows.iter().filter(|r| pred(r)) {
        if !patients.contains(&row.patient_id) {
            patients.push(row.patient_id);
        }
    }
    patients
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn member(id: i64, index_date: NaiveDate) -> IndexedMember {
        IndexedMember {
            patient_id: PatientId(id),
            index_date,
        }
    }

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .add_observation_period(ObservationPeriod {
                patient_id: PatientId(1),
                start_date: date(2020, 1, 1),
                end_date: date(2020, 12, 31),
            })
            .add_observation_period(ObservationPeriod {
                patient_id: PatientId(2),
                start_date: date(2021, 1, 1),
                end_date: date(2021, 6, 30),
            });
        store
    }

    #[test]
    fn test_pre_and_post_index_days() {
        let members = vec![member(1, date(2020, 3, 1))];
        let outcome = days_available(&store(), &Config::default(), &members, "rel_23r1").unwrap();

        assert!(!outcome.has_diagnostics());
        let row = &outcome.rows[0];
        assert_eq!(row.pre_index_days, 60);
        assert_eq!(row.post_index_days, 305);
    }

    #[test]
    fn test_missing_periods_and_out_of_range_index() {
        let members = vec![
            member(1, date(2019, 12, 1)),
            member(2, date(2021, 7, 10)),
            member(3, date(2021, 1, 1)),
        ];
        let outcome = days_available(&store(), &Config::default(), &members, "rel_23r1").unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].pre_index_days, -31);
        assert_eq!(outcome.rows[1].post_index_days, -10);
        assert_eq!(
            outcome.diagnostics,
            vec![
                Diagnostic::PatientsWithoutRecords {
                    source: "observation period".into(),
                    count: 1,
                },
                Diagnostic::IndexBeforeObservation {
                    patients: vec![PatientId(1)],
                },
                Diagnostic::IndexAfterObservation {
                    patients: vec![PatientId(2)],
                },
            ]
        );
    }

    #[test]
    fn test_every_period_of_a_patient_is_joined() {
        let mut store = MemoryStore::new();
        store
            .add_observation_period(ObservationPeriod {
                patient_id: PatientId(1),
                start_date: date(2021, 1, 1),
                end_date: date(2021, 12, 31),
            })
            .add_observation_period(ObservationPeriod {
                patient_id: PatientId(1),
                start_date: date(2020, 1, 1),
                end_date: date(2020, 6, 30),
            });

        let members = vec![member(1, date(2020, 3, 1)), member(2, date(2020, 3, 1))];
        let outcome = days_available(&store, &Config::default(), &members, "rel_23r1").unwrap();

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.rows[0].observation_start, date(2020, 1, 1));
        assert_eq!(outcome.rows[0].pre_index_days, 60);
        assert_eq!(outcome.rows[0].post_index_days, 121);
        assert_eq!(outcome.rows[1].observation_start, date(2021, 1, 1));
        assert_eq!(outcome.rows[1].pre_index_days, -306);
        assert_eq!(
            outcome.diagnostics,
            vec![
                Diagnostic::PatientsWithoutRecords {
                    source: "observation period".into(),
                    count: 1,
                },
                Diagnostic::IndexBeforeObservation {
                    patients: vec![PatientId(1)],
                },
            ]
        );
    }

    #[test]
    fn test_invalid_arguments() {
        let duplicated = vec![member(1, date(2020, 3, 1)), member(1, date(2020, 4, 1))];
        assert!(matches!(
            days_available(&store(), &Config::default(), &duplicated, "rel_23r1"),
            Err(Error::InvalidArgument(_))
        ));

        let members = vec![member(1, date(2020, 3, 1))];
        assert!(matches!(
            days_available(&store(), &Config::default(), &members, "unknown"),
            Err(Error::Version { .. })
        ));
    }
}
