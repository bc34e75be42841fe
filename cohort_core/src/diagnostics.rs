//! Non-fatal data-quality diagnostics.
//!
//! Diagnostics never change control flow. Each one is logged through
//! `tracing` when raised and handed back to the caller in an [`Outcome`].

use crate::PatientId;
use serde::Serialize;
use std::fmt;

/// A data-quality signal raised while producing a result
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Encounter count exceeds the number of days in the observation window
    UtilizationExceedsPeriod {
        label: String,
        patients: Vec<PatientId>,
    },
    /// Some requested patients have no qualifying records
    PatientsWithoutRecords { source: String, count: usize },
    /// The aggregation policy name was not recognized
    UnrecognizedPolicy { requested: String },
    /// The request named zero patients
    EmptyPatientList,
    /// Index date falls before the recorded observation period
    IndexBeforeObservation { patients: Vec<PatientId> },
    /// Index date falls after the recorded observation period
    IndexAfterObservation { patients: Vec<PatientId> },
    /// A 1-7 rating scale contains zero values
    ZeroScaleValues { scale: String, count: usize },
    /// NaN or infinite values dropped before aggregation
    NonFiniteValues { count: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UtilizationExceedsPeriod { label, patients } => write!(
                f,
                "number of {} visits exceeds the number of days in the period for {} patient(s)",
                label,
                patients.len()
            ),
            Diagnostic::PatientsWithoutRecords { source, count } => {
                write!(f, "{} patient(s) have no {} records", count, source)
            }
            Diagnostic::UnrecognizedPolicy { requested } => {
                write!(f, "aggregation method '{}' not found", requested)
            }
            Diagnostic::EmptyPatientList => write!(f, "trying to get data for 0 patients"),
            Diagnostic::IndexBeforeObservation { patients } => write!(
                f,
                "{} patient(s) have an index date before the observation period start",
                patients.len()
            ),
            Diagnostic::IndexAfterObservation { patients } => write!(
                f,
                "{} patient(s) have an index date after the observation period end",
                patients.len()
            ),
            Diagnostic::ZeroScaleValues { scale, count } => {
                write!(f, "{} contains {} zero value(s)", scale, count)
            }
            Diagnostic::NonFiniteValues { count } => {
                write!(f, "dropped {} non-finite measurement value(s)", count)
            }
        }
    }
}

/// Rows produced by an engine call plus the diagnostics raised along the way
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Outcome<T> {
    pub rows: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn new(rows: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { rows, diagnostics }
    }

    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Collects diagnostics for one call, logging each as it arrives
#[derive(Debug, Default)]
pub(crate) struct DiagnosticLog {
    entries: Vec<Diagnostic>,
}

impl DiagnosticLog {
    pub(crate) fn raise(&mut self, diagnostic: Diagnostic) {
        tracing::warn!("{}", diagnostic);
        self.entries.push(diagnostic);
    }

    pub(crate) fn finish<T>(self, rows: T) -> Outcome<T> {
        Outcome::new(rows, self.entries)
    }
}
