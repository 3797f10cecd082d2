//! Twin mirror: pushes observed printer state into the structured remote
//! object operators and PLCs read.
//!
//! Writes are buffered per printer and flushed by an explicit `commit()`,
//! at most once per worker tick. The twin is advisory; a failed or stale
//! mirror never blocks reconciliation, the store stays the source of truth.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::driver::PrinterStatus;
use crate::models::Printer;

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("unsupported twin endpoint {0:?}: this build ships the in-memory backend only")]
    UnsupportedEndpoint(String),
    #[error("twin mutex poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Attribute document
// ---------------------------------------------------------------------------

/// Job attributes of a twin object. Zero defaults when no job is present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinJob {
    pub file: String,
    pub progress: f64,
    pub time_used: f64,
    pub time_left: f64,
    pub time_left_approx: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinTemperature {
    pub actual: f64,
    pub target: f64,
}

/// Fixed attribute layout of a printer twin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinPrinter {
    pub url: String,
    pub update_time: String,
    pub state: String,
    pub bed: TwinTemperature,
    pub nozzle: TwinTemperature,
    pub camera_url: String,
    pub model: String,
    pub job: TwinJob,
}

impl TwinPrinter {
    /// Assemble the document for one observation.
    pub fn from_status(printer: &Printer, status: &PrinterStatus) -> TwinPrinter {
        let job = match &status.latest_job {
            Some(lj) => TwinJob {
                file: lj.file_path.clone(),
                progress: lj.progress.unwrap_or(0.0),
                time_used: lj.time_used,
                time_left: lj.time_left,
                time_left_approx: lj.time_approx.unwrap_or(0.0),
            },
            None => TwinJob::default(),
        };

        TwinPrinter {
            url: printer.url.clone(),
            update_time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            state: status.state.as_str().to_string(),
            bed: TwinTemperature {
                actual: status.temp_bed.actual,
                target: status.temp_bed.target,
            },
            nozzle: TwinTemperature {
                actual: status.temp_nozzle.actual,
                target: status.temp_nozzle.target,
            },
            camera_url: printer.camera_url.clone().unwrap_or_default(),
            model: printer.model.clone().unwrap_or_default(),
            job,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

enum TwinBackend {
    /// Process-local attribute table; selected by a "mock" host and used by
    /// every test. The `opc.tcp` transport binding lives outside this crate.
    Memory(Mutex<HashMap<String, TwinPrinter>>),
}

/// Buffered twin writer shared by all workers.
pub struct TwinClient {
    namespace: String,
    backend: TwinBackend,
    pending: Mutex<Vec<(String, TwinPrinter)>>,
}

impl TwinClient {
    /// Select a backend from the configured endpoint. A host containing
    /// "mock" yields the in-memory twin; anything else is rejected.
    pub fn connect(endpoint: &str, namespace: &str, is_mock: bool) -> Result<TwinClient, TwinError> {
        if !is_mock {
            return Err(TwinError::UnsupportedEndpoint(endpoint.to_string()));
        }

        info!(endpoint, namespace, "twin connected (in-memory backend)");
        Ok(TwinClient {
            namespace: namespace.to_string(),
            backend: TwinBackend::Memory(Mutex::new(HashMap::new())),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// In-memory twin, independent of configuration. Used by tests.
    pub fn in_memory() -> TwinClient {
        TwinClient {
            namespace: "mock".to_string(),
            backend: TwinBackend::Memory(Mutex::new(HashMap::new())),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Buffer an attribute update for the named twin object. Idempotent per
    /// (name, document); the last write before a commit wins.
    pub fn update(&self, name: &str, doc: TwinPrinter) -> Result<(), TwinError> {
        let mut pending = self.pending.lock().map_err(|_| TwinError::Poisoned)?;
        pending.push((name.to_string(), doc));
        Ok(())
    }

    /// Flush buffered updates to the backend. Called at most once per worker
    /// tick; an empty buffer is a no-op.
    pub async fn commit(&self) -> Result<(), TwinError> {
        let updates: Vec<(String, TwinPrinter)> = {
            let mut pending = self.pending.lock().map_err(|_| TwinError::Poisoned)?;
            std::mem::take(&mut *pending)
        };

        if updates.is_empty() {
            return Ok(());
        }

        match &self.backend {
            TwinBackend::Memory(table) => {
                let mut table = table.lock().map_err(|_| TwinError::Poisoned)?;
                for (name, doc) in updates {
                    debug!(twin = %name, state = %doc.state, "twin updated");
                    table.insert(name, doc);
                }
            }
        }

        Ok(())
    }

    /// Read a twin object back. Operators query this; tests assert on it.
    pub fn get(&self, name: &str) -> Result<Option<TwinPrinter>, TwinError> {
        match &self.backend {
            TwinBackend::Memory(table) => {
                let table = table.lock().map_err(|_| TwinError::Poisoned)?;
                Ok(table.get(name).cloned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{LatestJob, PrinterState, Temperature};
    use crate::models::PrinterApi;

    fn printer() -> Printer {
        Printer {
            id: 1,
            url: "http://printer-1.local".into(),
            api_key: None,
            api: PrinterApi::Mock,
            group_name: None,
            active: true,
            opcua_name: Some("Printer1".into()),
            camera_url: Some("http://printer-1.local/cam".into()),
            model: Some("Prusa XL".into()),
            create_time: Utc::now(),
        }
    }

    fn status(latest_job: Option<LatestJob>) -> PrinterStatus {
        PrinterStatus {
            state: PrinterState::Printing,
            temp_bed: Temperature { actual: 55.0, target: 60.0 },
            temp_nozzle: Temperature { actual: 210.0, target: 220.0 },
            latest_job,
        }
    }

    #[test]
    fn test_document_with_job() {
        let doc = TwinPrinter::from_status(
            &printer(),
            &status(Some(LatestJob {
                id: None,
                file_path: "server-1.gcode".into(),
                progress: Some(40.0),
                time_used: 120.0,
                time_left: 180.0,
                time_approx: Some(300.0),
                previewed_model_url: None,
            })),
        );

        assert_eq!(doc.state, "printing");
        assert_eq!(doc.bed.actual, 55.0);
        assert_eq!(doc.job.file, "server-1.gcode");
        assert_eq!(doc.job.time_left_approx, 300.0);
        assert_eq!(doc.camera_url, "http://printer-1.local/cam");
    }

    #[test]
    fn test_document_without_job_has_zero_defaults() {
        let doc = TwinPrinter::from_status(&printer(), &status(None));
        assert_eq!(doc.job, TwinJob::default());
        assert_eq!(doc.job.progress, 0.0);
    }

    #[tokio::test]
    async fn test_updates_are_buffered_until_commit() {
        let twin = TwinClient::in_memory();
        let doc = TwinPrinter::from_status(&printer(), &status(None));

        twin.update("Printer1", doc.clone()).unwrap();
        assert!(twin.get("Printer1").unwrap().is_none());

        twin.commit().await.unwrap();
        let stored = twin.get("Printer1").unwrap().unwrap();
        assert_eq!(stored.state, "printing");
    }

    #[tokio::test]
    async fn test_last_write_wins_within_a_commit() {
        let twin = TwinClient::in_memory();
        let mut doc = TwinPrinter::from_status(&printer(), &status(None));
        twin.update("Printer1", doc.clone()).unwrap();
        doc.state = "ready".into();
        twin.update("Printer1", doc).unwrap();

        twin.commit().await.unwrap();
        assert_eq!(twin.get("Printer1").unwrap().unwrap().state, "ready");
    }

    #[test]
    fn test_rejects_non_mock_endpoint() {
        let result = TwinClient::connect("opc.tcp://plc1:4840", "ns", false);
        assert!(matches!(result, Err(TwinError::UnsupportedEndpoint(_))));
    }
}
