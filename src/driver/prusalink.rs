//! PrusaLink driver.
//!
//! Speaks the PrusaLink v1 REST API. Files live on the `usb` storage; job
//! control is id-based (`DELETE /api/v1/job/{id}`). PrusaLink reports state
//! as a plain string, mapped fail-fast onto the common state enum.

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{
    gcode_basename, DriverError, LatestJob, PrinterState, PrinterStatus, Temperature,
};

pub struct PrusaLinkDriver {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire models
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatusResponse {
    printer: StatusPrinter,
}

#[derive(Debug, Deserialize)]
struct StatusPrinter {
    state: String,
    #[serde(default)]
    temp_bed: f64,
    #[serde(default)]
    target_bed: f64,
    #[serde(default)]
    temp_nozzle: f64,
    #[serde(default)]
    target_nozzle: f64,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    id: Option<i64>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    time_printing: Option<f64>,
    #[serde(default)]
    time_remaining: Option<f64>,
    file: Option<JobFile>,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    display_name: Option<String>,
    name: Option<String>,
    refs: Option<JobFileRefs>,
}

#[derive(Debug, Deserialize)]
struct JobFileRefs {
    thumbnail: Option<String>,
}

/// Map a PrusaLink state string onto the common enum. Unknown strings fail
/// fast rather than being guessed at.
fn parse_state(state: &str) -> Result<PrinterState, DriverError> {
    match state.to_ascii_lowercase().as_str() {
        "idle" | "ready" | "finished" | "attention" => Ok(PrinterState::Ready),
        "stopped" => Ok(PrinterState::Stopped),
        "printing" | "paused" => Ok(PrinterState::Printing),
        "error" | "busy" => Ok(PrinterState::Error),
        other => Err(DriverError::UnknownState(other.to_string())),
    }
}

impl PrusaLinkDriver {
    pub fn new(client: Client, url: &str, api_key: Option<String>) -> PrusaLinkDriver {
        PrusaLinkDriver {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    /// PrusaLink has no connection handshake; the first status call is it.
    pub async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    pub async fn current_status(&self) -> Result<PrinterStatus, DriverError> {
        let resp = self
            .request(self.client.get(self.url("/api/v1/status")))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DriverError::Unauthorized)
            }
            s => {
                return Err(DriverError::Unexpected {
                    operation: "current_status",
                    status: s.as_u16(),
                })
            }
        }

        let model: StatusResponse = resp.json().await?;
        let latest_job = self.latest_job().await?;

        Ok(PrinterStatus {
            state: parse_state(&model.printer.state)?,
            temp_bed: Temperature {
                actual: model.printer.temp_bed,
                target: model.printer.target_bed,
            },
            temp_nozzle: Temperature {
                actual: model.printer.temp_nozzle,
                target: model.printer.target_nozzle,
            },
            latest_job,
        })
    }

    pub async fn upload_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        let filename = gcode_basename(gcode_path);
        let content = tokio::fs::read(gcode_path).await?;

        let resp = self
            .request(
                self.client
                    .put(self.url(&format!("/api/v1/files/usb/{filename}"))),
            )
            .header("Print-After-Upload", "0")
            .header("Content-Type", "application/octet-stream")
            .body(content)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            StatusCode::NOT_FOUND => Err(DriverError::NotFound),
            StatusCode::CONFLICT => Err(DriverError::FileAlreadyExists),
            StatusCode::UNPROCESSABLE_ENTITY => Err(DriverError::InvalidContent),
            s => Err(DriverError::Unexpected {
                operation: "upload_file",
                status: s.as_u16(),
            }),
        }
    }

    pub async fn delete_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        let filename = gcode_basename(gcode_path);
        let resp = self
            .request(
                self.client
                    .delete(self.url(&format!("/api/v1/files/usb/{filename}"))),
            )
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            StatusCode::NOT_FOUND => Err(DriverError::NotFound),
            StatusCode::CONFLICT => Err(DriverError::FileInUse),
            s => Err(DriverError::Unexpected {
                operation: "delete_file",
                status: s.as_u16(),
            }),
        }
    }

    pub async fn start_job(&self, gcode_path: &str) -> Result<(), DriverError> {
        let filename = gcode_basename(gcode_path);
        let resp = self
            .request(
                self.client
                    .post(self.url(&format!("/api/v1/files/usb/{filename}"))),
            )
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            StatusCode::NOT_FOUND => Err(DriverError::NotFound),
            StatusCode::CONFLICT => Err(DriverError::PrinterIsBusy),
            s => Err(DriverError::Unexpected {
                operation: "start_job",
                status: s.as_u16(),
            }),
        }
    }

    pub async fn stop_job(&self) -> Result<(), DriverError> {
        let job = match self.latest_job().await? {
            Some(job) => job,
            None => return Ok(()),
        };

        let id = match job.id {
            Some(id) => id,
            None => return Ok(()),
        };

        let resp = self
            .request(self.client.delete(self.url(&format!("/api/v1/job/{id}"))))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // The job finished or vanished between the two calls.
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            StatusCode::CONFLICT => Err(DriverError::PrinterIsBusy),
            s => Err(DriverError::Unexpected {
                operation: "stop_job",
                status: s.as_u16(),
            }),
        }
    }

    pub async fn latest_job(&self) -> Result<Option<LatestJob>, DriverError> {
        let resp = self
            .request(self.client.get(self.url("/api/v1/job")))
            .send()
            .await?;

        match resp.status() {
            StatusCode::NO_CONTENT => return Ok(None),
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DriverError::Unauthorized)
            }
            s => {
                return Err(DriverError::Unexpected {
                    operation: "latest_job",
                    status: s.as_u16(),
                })
            }
        }

        let model: JobResponse = resp.json().await?;

        let file = match model.file {
            Some(file) => file,
            None => return Ok(None),
        };
        let file_path = match file.display_name.or(file.name) {
            Some(name) => name,
            None => return Ok(None),
        };

        let time_used = model.time_printing.unwrap_or(0.0);
        let time_left = model.time_remaining.unwrap_or(0.0);
        let progress = model.progress.or_else(|| derive_progress(time_used, model.time_remaining));

        Ok(Some(LatestJob {
            id: model.id,
            file_path,
            progress,
            time_used,
            time_left,
            time_approx: None,
            previewed_model_url: file.refs.and_then(|r| r.thumbnail),
        }))
    }
}

/// Percentage from elapsed/remaining time when the API omits `progress`.
fn derive_progress(time_used: f64, time_remaining: Option<f64>) -> Option<f64> {
    let left = time_remaining?;
    let total = time_used + left;
    if total <= 0.0 {
        return None;
    }
    Some(time_used / total * 100.0)
}
