//! OctoPrint driver.
//!
//! Speaks the OctoPrint REST API: state flags from `/api/printer`, job
//! progress from `/api/job`, file management under `/api/files/local`.
//! Authentication is the `X-Api-Key` header.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{
    gcode_basename, DriverError, LatestJob, PrinterState, PrinterStatus, Temperature,
};

pub struct OctoPrintDriver {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire models
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OctoPrinterResponse {
    state: OctoStateInfo,
    temperature: Option<OctoTemperatures>,
}

#[derive(Debug, Deserialize)]
struct OctoStateInfo {
    flags: OctoStateFlags,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OctoStateFlags {
    operational: bool,
    ready: bool,
    printing: bool,
    paused: bool,
    pausing: bool,
    cancelling: bool,
    error: bool,
    #[serde(rename = "closedOrError")]
    closed_or_error: bool,
}

#[derive(Debug, Deserialize)]
struct OctoTemperatures {
    bed: Option<OctoTemperature>,
    tool0: Option<OctoTemperature>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OctoTemperature {
    actual: Option<f64>,
    target: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OctoJobResponse {
    job: OctoJob,
    progress: OctoProgress,
}

#[derive(Debug, Deserialize)]
struct OctoJob {
    file: Option<OctoFile>,
    #[serde(rename = "estimatedPrintTime")]
    estimated_print_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OctoFile {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OctoProgress {
    completion: Option<f64>,
    #[serde(rename = "printTime")]
    print_time: Option<f64>,
    #[serde(rename = "printTimeLeft")]
    print_time_left: Option<f64>,
}

fn parse_state(flags: &OctoStateFlags) -> Result<PrinterState, DriverError> {
    if flags.printing {
        Ok(PrinterState::Printing)
    } else if flags.paused || flags.pausing {
        Ok(PrinterState::Paused)
    } else if flags.cancelling {
        Ok(PrinterState::Stopped)
    } else if flags.error || flags.closed_or_error {
        Ok(PrinterState::Error)
    } else if flags.ready || flags.operational {
        Ok(PrinterState::Ready)
    } else {
        Err(DriverError::UnknownState(format!("{flags:?}")))
    }
}

impl OctoPrintDriver {
    pub fn new(client: Client, url: &str, api_key: Option<String>) -> OctoPrintDriver {
        OctoPrintDriver {
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

    pub async fn connect(&self) -> Result<(), DriverError> {
        let resp = self
            .request(self.client.post(self.url("/api/connection")))
            .json(&json!({ "command": "connect" }))
            .send()
            .await?;
        check_common(resp.status(), "connect")
    }

    pub async fn current_status(&self) -> Result<PrinterStatus, DriverError> {
        let resp = self
            .request(self.client.get(self.url("/api/printer")))
            .send()
            .await?;
        check_common(resp.status(), "current_status")?;

        let model: OctoPrinterResponse = resp.json().await?;
        let state = parse_state(&model.state.flags)?;

        let (bed, nozzle) = match &model.temperature {
            Some(t) => (
                octo_temperature(t.bed.as_ref()),
                octo_temperature(t.tool0.as_ref()),
            ),
            None => (Temperature::default(), Temperature::default()),
        };

        let latest_job = self.latest_job().await?;

        Ok(PrinterStatus {
            state,
            temp_bed: bed,
            temp_nozzle: nozzle,
            latest_job,
        })
    }

    pub async fn upload_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        let filename = gcode_basename(gcode_path);
        let content = tokio::fs::read(gcode_path).await?;

        let part = reqwest::multipart::Part::bytes(content).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .request(self.client.post(self.url("/api/files/local")))
            .multipart(form)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            StatusCode::CONFLICT => Err(DriverError::FileInUse),
            StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                Err(DriverError::InvalidContent)
            }
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
                    .delete(self.url(&format!("/api/files/local/{filename}"))),
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
                    .post(self.url(&format!("/api/files/local/{filename}"))),
            )
            .json(&json!({ "command": "select", "print": true }))
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
        let resp = self
            .request(self.client.post(self.url("/api/job")))
            .json(&json!({ "command": "cancel" }))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // 409 means no active job; stopping an idle printer is fine.
            StatusCode::CONFLICT => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
            s => Err(DriverError::Unexpected {
                operation: "stop_job",
                status: s.as_u16(),
            }),
        }
    }

    pub async fn latest_job(&self) -> Result<Option<LatestJob>, DriverError> {
        let resp = self
            .request(self.client.get(self.url("/api/job")))
            .send()
            .await?;
        check_common(resp.status(), "latest_job")?;

        let model: OctoJobResponse = resp.json().await?;

        let name = match model.job.file.and_then(|f| f.name) {
            Some(name) => name,
            None => return Ok(None),
        };

        Ok(Some(LatestJob {
            id: None,
            file_path: name,
            progress: model.progress.completion,
            time_used: model.progress.print_time.unwrap_or(0.0),
            time_left: model.progress.print_time_left.unwrap_or(0.0),
            time_approx: model.job.estimated_print_time,
            previewed_model_url: None,
        }))
    }
}

fn octo_temperature(temp: Option<&OctoTemperature>) -> Temperature {
    match temp {
        Some(t) => Temperature {
            actual: t.actual.unwrap_or(0.0),
            target: t.target.unwrap_or(0.0),
        },
        None => Temperature::default(),
    }
}

fn check_common(status: StatusCode, operation: &'static str) -> Result<(), DriverError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DriverError::Unauthorized),
        // OctoPrint answers 409 when the printer is not operational.
        StatusCode::CONFLICT => Err(DriverError::PrinterIsBusy),
        s => Err(DriverError::Unexpected {
            operation,
            status: s.as_u16(),
        }),
    }
}
