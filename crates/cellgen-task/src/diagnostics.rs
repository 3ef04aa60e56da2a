//! Sink for unrecoverable failures.

use cellgen_spatial::CellPos;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

/// Structured description of a failure that could not be handled in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub cell: CellPos,
    /// Ordered `(key, value)` context such as stage, category or phase.
    pub context: Vec<(&'static str, String)>,
    pub error: String,
}

impl FailureReport {
    #[must_use]
    pub fn new(cell: CellPos, error: impl Into<String>) -> Self {
        Self {
            cell,
            context: Vec::new(),
            error: error.into(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Value of the first context entry named `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait Diagnostics: Send + Sync {
    fn report(&self, report: &FailureReport);
}

/// Logs every report at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, report: &FailureReport) {
        error!(
            cell = %report.cell,
            context = ?report.context,
            error = %report.error,
            "unrecoverable cell failure"
        );
    }
}

/// Keeps reports in memory (and logs them), for hosts that surface them later.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<FailureReport> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn report(&self, report: &FailureReport) {
        TracingDiagnostics.report(report);
        self.reports.lock().push(report.clone());
    }
}
