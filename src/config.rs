//! Environment-driven configuration.
//!
//! Every option can be supplied as a command-line flag or an environment
//! variable; the environment is the normal deployment path.

use std::fs;
use std::path::PathBuf;

use clap::Parser;

/// Control-plane settings.
#[derive(Debug, Clone, Parser)]
#[command(name = "printfarm-server", about = "Print-farm control plane")]
pub struct Settings {
    /// Database connection string, e.g. `sqlite://printfarm.db`.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://printfarm.db")]
    pub database_url: String,

    /// OPC UA server endpoint; a host containing "mock" selects the
    /// in-memory twin.
    #[arg(long, env = "OPCUA_SERVER_URL", default_value = "opc.tcp://mock:4840")]
    pub opcua_server_url: String,

    /// Namespace URI of the twin objects.
    #[arg(
        long,
        env = "OPCUA_SERVER_NAMESPACE",
        default_value = "https://printfarm.local/opcua"
    )]
    pub opcua_server_namespace: String,

    /// Directory receiving uploaded gcode files.
    #[arg(long, env = "UPLOAD_PATH", default_value = "upload")]
    pub upload_path: PathBuf,

    /// Seconds between printer worker reconciliation steps.
    #[arg(long, env = "PRINTER_WORKER_INTERVAL", default_value_t = 5.0)]
    pub printer_worker_interval: f64,

    /// Seconds between scheduler passes.
    #[arg(long, env = "ORDER_FETCHER_INTERVAL", default_value_t = 5.0)]
    pub order_fetcher_interval: f64,

    /// Seconds between mock printer simulation ticks.
    #[arg(long, env = "MOCK_PRINTER_INTERVAL", default_value_t = 1.0)]
    pub mock_printer_interval: f64,

    /// Simulated ticks a mock print takes to finish.
    #[arg(long, env = "MOCK_PRINTER_JOB_TIME", default_value_t = 100)]
    pub mock_printer_job_time: u32,

    /// Target bed temperature of mock printers (°C).
    #[arg(long, env = "MOCK_PRINTER_TARGET_BED_TEMPERATURE", default_value_t = 60)]
    pub mock_printer_target_bed_temperature: i32,

    /// Target nozzle temperature of mock printers (°C).
    #[arg(long, env = "MOCK_PRINTER_TARGET_BED_NOZZLE", default_value_t = 220)]
    pub mock_printer_target_nozzle_temperature: i32,

    /// Assign unassigned approved jobs to idle printers automatically.
    #[arg(long, env = "AUTO_SCHEDULE", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_schedule: bool,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL.
    #[arg(long, env = "LOGGING_LEVEL", default_value = "INFO")]
    pub logging_level: String,

    /// Seconds within which driver-reported and stored job start times are
    /// considered the same job.
    #[arg(long, env = "JOB_MATCH_TOLERANCE", default_value_t = 10.0)]
    pub job_match_tolerance_secs: f64,

    /// Listen address of the HTTP API.
    #[arg(long, env = "HTTP_BIND", default_value = "0.0.0.0:8000")]
    pub http_bind: String,

    /// Directory for daily-rotated log files; stderr only when unset.
    #[arg(long, env = "LOG_PATH")]
    pub log_path: Option<PathBuf>,
}

impl Settings {
    /// Parse settings from the process environment (no CLI arguments).
    pub fn from_env() -> Settings {
        Settings::parse_from(["printfarm-server"])
    }

    /// Map the configured level onto a tracing directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.logging_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            "CRITICAL" => "error",
            _ => "info",
        }
    }

    /// Ensure the upload directory exists.
    pub fn ensure_upload_path(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.upload_path)
    }

    /// True when the twin endpoint addresses the in-memory backend.
    pub fn twin_is_mock(&self) -> bool {
        host_of(&self.opcua_server_url)
            .map(|h| h.contains("mock"))
            .unwrap_or(false)
    }
}

/// Pull the host out of a URL-ish string without a URL parser dependency.
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.split(['/', '?']).next()?;
    let host = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    Some(host.split(':').next().unwrap_or(host))
}
