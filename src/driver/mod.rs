//! Printer drivers: a uniform view over vendor HTTP APIs.
//!
//! One variant per supported API (OctoPrint, PrusaLink, Mock). Callers hold
//! a [`Driver`] and never see vendor payloads; every operation returns the
//! shared [`DriverError`] taxonomy so the worker can classify failures
//! without knowing which vendor it is talking to.

pub mod mock;
pub mod octoprint;
pub mod prusalink;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Printer, PrinterApi};

pub use mock::{MockDriver, MockSettings};
pub use octoprint::OctoPrintDriver;
pub use prusalink::PrusaLinkDriver;

// ---------------------------------------------------------------------------
// Common status model
// ---------------------------------------------------------------------------

/// Vendor-independent printer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Ready,
    Printing,
    Paused,
    Stopped,
    Error,
}

impl PrinterState {
    /// Idle enough to accept a new job.
    pub fn is_ready(&self) -> bool {
        matches!(self, PrinterState::Ready | PrinterState::Stopped)
    }

    /// A job is actively occupying the head.
    pub fn is_printing(&self) -> bool {
        matches!(self, PrinterState::Printing | PrinterState::Paused)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PrinterState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterState::Ready => "ready",
            PrinterState::Printing => "printing",
            PrinterState::Paused => "paused",
            PrinterState::Stopped => "stopped",
            PrinterState::Error => "error",
        }
    }
}

/// One heater's reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub actual: f64,
    pub target: f64,
}

impl Temperature {
    pub fn heating_finished(&self) -> bool {
        self.actual >= self.target
    }
}

/// The job a printer reports as current or most recent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestJob {
    /// Vendor-side job id, when the API has one (PrusaLink).
    pub id: Option<i64>,
    /// Filename as the printer stores it.
    pub file_path: String,
    /// Completion percentage in `[0, 100]`, when reported.
    pub progress: Option<f64>,
    pub time_used: f64,
    pub time_left: f64,
    pub time_approx: Option<f64>,
    pub previewed_model_url: Option<String>,
}

impl LatestJob {
    pub fn done(&self) -> bool {
        matches!(self.progress, Some(p) if p >= 100.0)
    }
}

/// Full snapshot of a printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub state: PrinterState,
    pub temp_bed: Temperature,
    pub temp_nozzle: Temperature,
    pub latest_job: Option<LatestJob>,
}

impl PrinterStatus {
    pub fn heating_finished(&self) -> bool {
        self.temp_bed.heating_finished() && self.temp_nozzle.heating_finished()
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("file is in use")]
    FileInUse,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("printer is busy")]
    PrinterIsBusy,
    #[error("invalid gcode content")]
    InvalidContent,
    #[error("unknown printer state {0:?}")]
    UnknownState(String),
    #[error("unexpected response status {status} from {operation}")]
    Unexpected { operation: &'static str, status: u16 },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Transient network-level failures; the worker skips the tick and the
    /// periodic runner demotes these to warnings.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Transport(_) | DriverError::Io(_))
    }
}

// ---------------------------------------------------------------------------
// Driver dispatch
// ---------------------------------------------------------------------------

/// A connected printer, dispatched over its vendor API.
pub enum Driver {
    OctoPrint(OctoPrintDriver),
    PrusaLink(PrusaLinkDriver),
    Mock(MockDriver),
}

impl Driver {
    /// Build the driver matching the printer row. HTTP drivers share the
    /// process-wide client; mock printers get their simulation settings.
    pub fn for_printer(
        printer: &Printer,
        http: &reqwest::Client,
        mock: &MockSettings,
    ) -> Driver {
        match printer.api {
            PrinterApi::OctoPrint => Driver::OctoPrint(OctoPrintDriver::new(
                http.clone(),
                &printer.url,
                printer.api_key.clone(),
            )),
            PrinterApi::PrusaLink => Driver::PrusaLink(PrusaLinkDriver::new(
                http.clone(),
                &printer.url,
                printer.api_key.clone(),
            )),
            PrinterApi::Mock => Driver::Mock(MockDriver::new(mock.clone())),
        }
    }

    /// Idempotent handshake; safe to call repeatedly.
    pub async fn connect(&self) -> Result<(), DriverError> {
        match self {
            Driver::OctoPrint(d) => d.connect().await,
            Driver::PrusaLink(d) => d.connect().await,
            Driver::Mock(d) => d.connect().await,
        }
    }

    pub async fn current_status(&self) -> Result<PrinterStatus, DriverError> {
        match self {
            Driver::OctoPrint(d) => d.current_status().await,
            Driver::PrusaLink(d) => d.current_status().await,
            Driver::Mock(d) => d.current_status().await,
        }
    }

    /// Upload local gcode into the printer's storage.
    pub async fn upload_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        match self {
            Driver::OctoPrint(d) => d.upload_file(gcode_path).await,
            Driver::PrusaLink(d) => d.upload_file(gcode_path).await,
            Driver::Mock(d) => d.upload_file(gcode_path).await,
        }
    }

    pub async fn delete_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        match self {
            Driver::OctoPrint(d) => d.delete_file(gcode_path).await,
            Driver::PrusaLink(d) => d.delete_file(gcode_path).await,
            Driver::Mock(d) => d.delete_file(gcode_path).await,
        }
    }

    /// Start printing an already-uploaded file.
    pub async fn start_job(&self, gcode_path: &str) -> Result<(), DriverError> {
        match self {
            Driver::OctoPrint(d) => d.start_job(gcode_path).await,
            Driver::PrusaLink(d) => d.start_job(gcode_path).await,
            Driver::Mock(d) => d.start_job(gcode_path).await,
        }
    }

    /// Cancel the current print; safe when nothing is printing.
    pub async fn stop_job(&self) -> Result<(), DriverError> {
        match self {
            Driver::OctoPrint(d) => d.stop_job().await,
            Driver::PrusaLink(d) => d.stop_job().await,
            Driver::Mock(d) => d.stop_job().await,
        }
    }

    pub async fn latest_job(&self) -> Result<Option<LatestJob>, DriverError> {
        match self {
            Driver::OctoPrint(d) => d.latest_job().await,
            Driver::PrusaLink(d) => d.latest_job().await,
            Driver::Mock(d) => d.latest_job().await,
        }
    }

    /// The mock simulation handle, when this driver is a mock.
    pub fn as_mock(&self) -> Option<&MockDriver> {
        match self {
            Driver::Mock(d) => Some(d),
            _ => None,
        }
    }
}

/// Basename of a gcode path, the name printers index files by.
pub(crate) fn gcode_basename(gcode_path: &str) -> String {
    std::path::Path::new(gcode_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| gcode_path.to_string())
}
