//! Domain entities shared by the store, workers, scheduler, and API.
//!
//! Job progress is tracked as a monotonic status bitmask: flags are only ever
//! added, never cleared, and every flag addition is mirrored by a job history
//! row. Composite predicates over the mask (pending / printing / needs-cancel
//! / needs-pickup) drive the worker state machine.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Printer API kinds
// ---------------------------------------------------------------------------

/// Vendor API spoken by a printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterApi {
    OctoPrint,
    #[serde(rename = "Prusa")]
    PrusaLink,
    Mock,
}

impl PrinterApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterApi::OctoPrint => "OctoPrint",
            PrinterApi::PrusaLink => "Prusa",
            PrinterApi::Mock => "Mock",
        }
    }

    pub fn parse(value: &str) -> Option<PrinterApi> {
        match value {
            "OctoPrint" => Some(PrinterApi::OctoPrint),
            "Prusa" | "PrusaLink" => Some(PrinterApi::PrusaLink),
            "Mock" => Some(PrinterApi::Mock),
            _ => None,
        }
    }
}

impl fmt::Display for PrinterApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job status bitmask
// ---------------------------------------------------------------------------

/// Bitmask of job lifecycle flags.
///
/// Flags combine monotonically under OR; a terminal state is reached by
/// adding `Picked`, `Cancelled`, or both. The raw value is what the store
/// persists and what the scheduler's equality filters run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobStatus(pub u32);

impl JobStatus {
    pub const CREATED: JobStatus = JobStatus(1);
    pub const APPROVED: JobStatus = JobStatus(2);
    pub const SCHEDULED: JobStatus = JobStatus(4);
    pub const PRINTING: JobStatus = JobStatus(8);
    pub const PRINTED: JobStatus = JobStatus(16);
    pub const PICKED: JobStatus = JobStatus(256);
    pub const CANCELLED: JobStatus = JobStatus(512);
    pub const PICKUP_ISSUED: JobStatus = JobStatus(1024);
    pub const CANCEL_ISSUED: JobStatus = JobStatus(2048);

    /// Created and approved, awaiting a printer assignment.
    pub const TO_SCHEDULE: JobStatus = JobStatus(1 | 2);
    /// Created, approved, and scheduled; the assigned worker launches it.
    pub const TO_PRINT: JobStatus = JobStatus(1 | 2 | 4);

    pub fn contains(&self, flag: JobStatus) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn intersects(&self, flags: JobStatus) -> bool {
        self.0 & flags.0 != 0
    }

    /// Exactly `ToPrint`: scheduled on a printer, nothing further happened.
    pub fn is_pending(&self) -> bool {
        *self == JobStatus::TO_PRINT
    }

    /// A cancel was requested and has not been honored yet.
    pub fn need_cancel(&self) -> bool {
        self.contains(JobStatus::CANCEL_ISSUED) && !self.contains(JobStatus::CANCELLED)
    }

    /// The print finished and no pickup signal has gone out yet.
    pub fn need_pickup(&self) -> bool {
        self.contains(JobStatus::PRINTED) && !self.contains(JobStatus::PICKUP_ISSUED)
    }

    /// Printing has started and no later progression or terminal flag is set.
    pub fn is_printing(&self) -> bool {
        self.contains(JobStatus::PRINTING)
            && !self.intersects(JobStatus(
                JobStatus::PRINTED.0 | JobStatus::PICKED.0 | JobStatus::CANCELLED.0,
            ))
    }

    pub fn is_printed(&self) -> bool {
        self.contains(JobStatus::PRINTED)
    }

    pub fn is_picked(&self) -> bool {
        self.contains(JobStatus::PICKED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.contains(JobStatus::CANCELLED)
    }

    /// Name of a single flag, used for job history rows.
    pub fn flag_name(&self) -> &'static str {
        match *self {
            JobStatus::CREATED => "Created",
            JobStatus::APPROVED => "Approved",
            JobStatus::SCHEDULED => "Scheduled",
            JobStatus::PRINTING => "Printing",
            JobStatus::PRINTED => "Printed",
            JobStatus::PICKED => "Picked",
            JobStatus::CANCELLED => "Cancelled",
            JobStatus::PICKUP_ISSUED => "PickupIssued",
            JobStatus::CANCEL_ISSUED => "CancelIssued",
            _ => "Unknown",
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::CREATED
    }
}

impl BitOr for JobStatus {
    type Output = JobStatus;

    fn bitor(self, rhs: JobStatus) -> JobStatus {
        JobStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for JobStatus {
    fn bitor_assign(&mut self, rhs: JobStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A known user. The id is an opaque external identity string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// "admin" or "user".
    pub role: String,
    pub create_time: DateTime<Utc>,
}

/// A managed physical (or simulated) printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    pub id: i64,
    pub url: String,
    pub api_key: Option<String>,
    pub api: PrinterApi,
    pub group_name: Option<String>,
    /// Whether a worker should run for this printer.
    pub active: bool,
    /// Name of the twin object mirroring this printer.
    pub opcua_name: Option<String>,
    pub camera_url: Option<String>,
    pub model: Option<String>,
    pub create_time: DateTime<Utc>,
}

/// A customer-facing intent that may spawn jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: String,
    pub printer_id: Option<i64>,
    pub cancelled: bool,
    pub create_time: DateTime<Utc>,
}

/// A tracked print attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub order_id: Option<i64>,
    pub user_id: Option<String>,
    pub printer_id: Option<i64>,
    pub status: JobStatus,
    /// True when the gcode was uploaded through the API and is
    /// server-managed; false when the job was observed on the printer.
    pub from_server: bool,
    pub gcode_file_path: Option<String>,
    pub original_filename: Option<String>,
    /// Filename as the printer reports it.
    pub printer_filename: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
}

impl Job {
    /// The filename the printer knows this job by: the reported printer
    /// filename if observed, otherwise the basename of the uploaded gcode.
    pub fn gcode_filename(&self) -> Option<String> {
        if let Some(name) = &self.printer_filename {
            return Some(name.clone());
        }

        self.gcode_file_path.as_ref().and_then(|path| {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }

    pub fn need_cancel(&self) -> bool {
        self.status.need_cancel()
    }

    pub fn need_pickup(&self) -> bool {
        self.status.need_pickup()
    }

    pub fn is_printing(&self) -> bool {
        self.status.is_printing()
    }

    pub fn is_printed(&self) -> bool {
        self.status.is_printed()
    }
}

/// Append-only log of status-flag additions for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistory {
    pub id: i64,
    pub job_id: i64,
    /// Name of the status flag that was added (e.g. "Printing").
    pub status: String,
    pub create_time: DateTime<Utc>,
}
