//! CSV output for engine results.
//!
//! Column names follow the extract conventions (`person_id`,
//! `measurement_date`, ...) so results can be joined back onto the inputs.

use crate::{AggregatedMeasurement, ConsolidatedVisitCount, DaysAvailable, MeasurementDelta, Result};
use std::io::Write;

#[derive(Debug, serde::Serialize)]
struct AggregateRow {
    person_id: i64,
    measurement_date: Option<String>,
    agg_value: i64,
}

impl From<&AggregatedMeasurement> for AggregateRow {
    fn from(row: &AggregatedMeasurement) -> Self {
        AggregateRow {
            person_id: row.patient_id.get(),
            measurement_date: row.measurement_date.map(|d| d.to_string()),
            agg_value: row.agg_value,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct PatientAggregateRow {
    person_id: i64,
    agg_value: i64,
}

#[derive(Debug, serde::Serialize)]
struct DeltaRow {
    person_id: i64,
    prev_measurement_date: String,
    prev_value: i64,
    measurement_date: String,
    value: i64,
    days_between_change: i64,
    value_change: i64,
}

impl From<&MeasurementDelta> for DeltaRow {
    fn from(delta: &MeasurementDelta) -> Self {
        DeltaRow {
            person_id: delta.patient_id.get(),
            prev_measurement_date: delta.prior_date.to_string(),
            prev_value: delta.prior_value,
            measurement_date: delta.current_date.to_string(),
            value: delta.current_value,
            days_between_change: delta.days_between,
            value_change: delta.value_change,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct DaysAvailableRow {
    person_id: i64,
    index_date: String,
    observation_period_start_date: String,
    observation_period_end_date: String,
    pre_index_days: i64,
    post_index_days: i64,
}

impl From<&DaysAvailable> for DaysAvailableRow {
    fn from(row: &DaysAvailable) -> Self {
        DaysAvailableRow {
            person_id: row.patient_id.get(),
            index_date: row.index_date.to_string(),
            observation_period_start_date: row.observation_start.to_string(),
            observation_period_end_date: row.observation_end.to_string(),
            pre_index_days: row.pre_index_days,
            post_index_days: row.post_index_days,
        }
    }
}

/// Write utilization counts with one column per label, in `labels` order
///
/// Rows lacking a label are written as 0.
pub fn write_utilization_csv<W: Write>(
    writer: W,
    labels: &[&str],
    rows: &[ConsolidatedVisitCount],
) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    let mut header = vec!["person_id", "period_duration"];
    header.extend_from_slice(labels);
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![row.patient_id.to_string(), row.period_days.to_string()];
        record.extend(labels.iter().map(|label| row.count(label).unwrap_or(0).to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    tracing::debug!("Wrote {} utilization rows", rows.len());
    Ok(())
}

/// Write aggregated readings
///
/// The `measurement_date` column is included only when the rows were
/// grouped by day.
pub fn write_aggregates_csv<W: Write>(writer: W, rows: &[AggregatedMeasurement]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let per_day = rows.iter().any(|r| r.measurement_date.is_some());

    for row in rows {
        if per_day {
            writer.serialize(AggregateRow::from(row))?;
        } else {
            writer.serialize(PatientAggregateRow {
                person_id: row.patient_id.get(),
                agg_value: row.agg_value,
            })?;
        }
    }
    if rows.is_empty() {
        writer.write_record(["person_id", "agg_value"])?;
    }

    writer.flush()?;
    tracing::debug!("Wrote {} aggregated rows", rows.len());
    Ok(())
}

/// Write successive-reading deltas
pub fn write_deltas_csv<W: Write>(writer: W, deltas: &[MeasurementDelta]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for delta in deltas {
        writer.serialize(DeltaRow::from(delta))?;
    }
    if deltas.is_empty() {
        writer.write_record([
            "person_id",
            "prev_measurement_date",
            "prev_value",
            "measurement_date",
            "value",
            "days_between_change",
            "value_change",
        ])?;
    }

    writer.flush()?;
    tracing::debug!("Wrote {} delta rows", deltas.len());
    Ok(())
}

/// Write days-available rows
pub fn write_days_available_csv<W: Write>(writer: W, rows: &[DaysAvailable]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(DaysAvailableRow::from(row))?;
    }
    if rows.is_empty() {
        writer.write_record([
            "person_id",
            "index_date",
            "observation_period_start_date",
            "observation_period_end_date",
            "pre_index_days",
            "post_index_days",
        ])?;
    }

    writer.flush()?;
    Ok(())
}
