//! Simulated printer.
//!
//! Deterministic device model used for farm bring-up and tests: a monotone
//! clock (ticked by an internal interval task, or manually) heats the bed
//! and nozzle linearly toward their targets and advances job progress only
//! once both are at temperature. The error taxonomy matches the real
//! drivers, including transport-fault injection for resilience tests.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{DriverError, LatestJob, PrinterState, PrinterStatus, Temperature};

/// Degrees gained (or shed) per simulation tick.
const HEAT_STEP: f64 = 10.0;

/// Simulation parameters, loaded from `MOCK_PRINTER_*` settings.
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Seconds between automatic simulation ticks; `0` disables the
    /// internal ticker (tests tick manually).
    pub interval_secs: f64,
    /// Ticks a job takes once heated.
    pub job_time: u32,
    pub bed_target: f64,
    pub nozzle_target: f64,
}

impl Default for MockSettings {
    fn default() -> MockSettings {
        MockSettings {
            interval_secs: 1.0,
            job_time: 100,
            bed_target: 60.0,
            nozzle_target: 220.0,
        }
    }
}

#[derive(Debug)]
struct MockJob {
    file: String,
    time_estimated: u32,
    time_used: u32,
    stopped: bool,
}

impl MockJob {
    fn printing(&self) -> bool {
        !self.stopped && self.time_used < self.time_estimated
    }

    fn progress(&self) -> f64 {
        f64::from(self.time_used) / f64::from(self.time_estimated) * 100.0
    }

    fn time_left(&self) -> u32 {
        self.time_estimated - self.time_used
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    bed_actual: f64,
    nozzle_actual: f64,
    files: HashSet<String>,
    jobs: Vec<MockJob>,
    /// Pending injected transport failures, consumed by `current_status`.
    transport_faults: u32,
}

pub struct MockDriver {
    settings: MockSettings,
    state: Arc<Mutex<MockState>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// A poisoned simulation mutex degrades to a transport error so the
/// worker's next tick retries instead of panicking its loop.
fn poisoned() -> DriverError {
    DriverError::Io(io::Error::new(
        io::ErrorKind::Other,
        "mock printer state lock poisoned",
    ))
}

impl MockDriver {
    pub fn new(settings: MockSettings) -> MockDriver {
        MockDriver {
            settings,
            state: Arc::new(Mutex::new(MockState::default())),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, MockState>, DriverError> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Start the internal interval task. Idempotent; a zero interval keeps
    /// the clock manual.
    pub fn start(&self) {
        let Ok(mut ticker) = self.ticker.lock() else {
            return;
        };
        if self.settings.interval_secs <= 0.0 || ticker.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs_f64(self.settings.interval_secs);
        let settings = self.settings.clone();

        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        if let Ok(mut state) = state.lock() {
                            advance(&mut state, &settings);
                        }
                    }
                }
            }
        }));
    }

    /// Stop the internal ticker; the simulation clock freezes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut ticker) = self.ticker.lock() {
            ticker.take();
        }
    }

    /// Advance the simulation one tick. Public so tests control time.
    pub fn tick(&self) {
        if let Ok(mut state) = self.state.lock() {
            advance(&mut state, &self.settings);
        }
    }

    /// Snapshot of the printer's file storage.
    pub fn files(&self) -> Vec<String> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut files: Vec<String> = state.files.iter().cloned().collect();
        files.sort();
        files
    }

    /// Make the next `count` status fetches fail with a transport error.
    pub fn inject_transport_faults(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.transport_faults += count;
        }
    }

    pub async fn connect(&self) -> Result<(), DriverError> {
        self.locked()?.connected = true;
        Ok(())
    }

    pub async fn current_status(&self) -> Result<PrinterStatus, DriverError> {
        let mut state = self.locked()?;

        if state.transport_faults > 0 {
            state.transport_faults -= 1;
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "injected transport fault",
            )));
        }

        ensure_connected(&state)?;

        Ok(PrinterStatus {
            state: printer_state(&state),
            temp_bed: Temperature {
                actual: state.bed_actual,
                target: self.settings.bed_target,
            },
            temp_nozzle: Temperature {
                actual: state.nozzle_actual,
                target: self.settings.nozzle_target,
            },
            latest_job: latest_job(&state),
        })
    }

    pub async fn upload_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        let mut state = self.locked()?;
        ensure_connected(&state)?;

        let name = super::gcode_basename(gcode_path);

        if file_in_use(&state, &name) {
            return Err(DriverError::FileInUse);
        }
        if state.files.contains(&name) {
            return Err(DriverError::FileAlreadyExists);
        }

        state.files.insert(name);
        Ok(())
    }

    pub async fn delete_file(&self, gcode_path: &str) -> Result<(), DriverError> {
        let mut state = self.locked()?;
        ensure_connected(&state)?;

        let name = super::gcode_basename(gcode_path);

        if !state.files.contains(&name) {
            return Err(DriverError::NotFound);
        }
        if file_in_use(&state, &name) {
            return Err(DriverError::FileInUse);
        }

        state.files.remove(&name);
        Ok(())
    }

    pub async fn start_job(&self, gcode_path: &str) -> Result<(), DriverError> {
        let mut state = self.locked()?;
        ensure_connected(&state)?;

        let name = super::gcode_basename(gcode_path);

        if !state.files.contains(&name) {
            return Err(DriverError::NotFound);
        }
        if state.jobs.iter().any(MockJob::printing) {
            return Err(DriverError::PrinterIsBusy);
        }

        let time_estimated = self.settings.job_time;
        state.jobs.push(MockJob {
            file: name,
            time_estimated,
            time_used: 0,
            stopped: false,
        });
        Ok(())
    }

    pub async fn stop_job(&self) -> Result<(), DriverError> {
        let mut state = self.locked()?;
        ensure_connected(&state)?;

        // Stopping an idle printer is a no-op.
        if let Some(job) = state.jobs.iter_mut().find(|j| j.printing()) {
            job.stopped = true;
        }
        Ok(())
    }

    pub async fn latest_job(&self) -> Result<Option<LatestJob>, DriverError> {
        let state = self.locked()?;
        Ok(latest_job(&state))
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ensure_connected(state: &MockState) -> Result<(), DriverError> {
    if state.connected {
        Ok(())
    } else {
        Err(DriverError::Unauthorized)
    }
}

fn printer_state(state: &MockState) -> PrinterState {
    if state.jobs.iter().any(MockJob::printing) {
        PrinterState::Printing
    } else {
        PrinterState::Ready
    }
}

fn file_in_use(state: &MockState, name: &str) -> bool {
    state.jobs.iter().any(|j| j.printing() && j.file == name)
}

fn latest_job(state: &MockState) -> Option<LatestJob> {
    let job = state.jobs.last()?;
    Some(LatestJob {
        id: None,
        file_path: job.file.clone(),
        progress: Some(job.progress()),
        time_used: f64::from(job.time_used),
        time_left: f64::from(job.time_left()),
        time_approx: Some(f64::from(job.time_estimated)),
        previewed_model_url: None,
    })
}

fn heating_finished(state: &MockState, settings: &MockSettings) -> bool {
    state.bed_actual >= settings.bed_target && state.nozzle_actual >= settings.nozzle_target
}

/// One simulation step: heat while a job is live, cool otherwise, and burn
/// job time only at temperature.
fn advance(state: &mut MockState, settings: &MockSettings) {
    let printing = state.jobs.iter().any(MockJob::printing);

    if printing {
        state.bed_actual = (state.bed_actual + HEAT_STEP).min(settings.bed_target);
        state.nozzle_actual = (state.nozzle_actual + HEAT_STEP).min(settings.nozzle_target);

        if heating_finished(state, settings) {
            if let Some(job) = state.jobs.iter_mut().find(|j| j.printing()) {
                job.time_used += 1;
            }
        }
    } else {
        state.bed_actual = (state.bed_actual - HEAT_STEP).max(0.0);
        state.nozzle_actual = (state.nozzle_actual - HEAT_STEP).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_mock() -> MockDriver {
        MockDriver::new(MockSettings {
            interval_secs: 0.0,
            job_time: 3,
            bed_target: 20.0,
            nozzle_target: 20.0,
        })
    }

    /// Ticks until heating completes for the test settings above.
    const HEATING_TICKS: u32 = 2;

    #[tokio::test]
    async fn test_requires_connection() {
        let mock = manual_mock();
        assert!(matches!(
            mock.current_status().await,
            Err(DriverError::Unauthorized)
        ));

        mock.connect().await.unwrap();
        assert!(mock.current_status().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_requires_uploaded_file() {
        let mock = manual_mock();
        mock.connect().await.unwrap();

        assert!(matches!(
            mock.start_job("a.gcode").await,
            Err(DriverError::NotFound)
        ));

        mock.upload_file("/tmp/a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();

        let status = mock.current_status().await.unwrap();
        assert_eq!(status.state, PrinterState::Printing);
    }

    #[tokio::test]
    async fn test_progress_waits_for_heating() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.upload_file("a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();

        // First tick heats only; the tick reaching temperature starts
        // burning job time.
        mock.tick();
        let job = mock.latest_job().await.unwrap().unwrap();
        assert_eq!(job.progress, Some(0.0));

        mock.tick();
        let job = mock.latest_job().await.unwrap().unwrap();
        assert!(job.progress.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.upload_file("a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();

        for _ in 0..(HEATING_TICKS + 3) {
            mock.tick();
        }

        let status = mock.current_status().await.unwrap();
        assert_eq!(status.state, PrinterState::Ready);
        assert!(status.latest_job.unwrap().done());
    }

    #[tokio::test]
    async fn test_upload_printing_file_is_in_use() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.upload_file("a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();

        assert!(matches!(
            mock.upload_file("a.gcode").await,
            Err(DriverError::FileInUse)
        ));
        assert!(matches!(
            mock.delete_file("a.gcode").await,
            Err(DriverError::FileInUse)
        ));
    }

    #[tokio::test]
    async fn test_second_job_while_printing_is_busy() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.upload_file("a.gcode").await.unwrap();
        mock.upload_file("b.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();

        assert!(matches!(
            mock.start_job("b.gcode").await,
            Err(DriverError::PrinterIsBusy)
        ));
    }

    #[tokio::test]
    async fn test_stop_job_is_safe_when_idle() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.stop_job().await.unwrap();

        mock.upload_file("a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();
        mock.stop_job().await.unwrap();

        let status = mock.current_status().await.unwrap();
        assert_eq!(status.state, PrinterState::Ready);

        // Second stop after the job is gone.
        mock.stop_job().await.unwrap();
    }

    #[tokio::test]
    async fn test_cooling_when_idle() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.upload_file("a.gcode").await.unwrap();
        mock.start_job("a.gcode").await.unwrap();
        mock.tick();
        mock.stop_job().await.unwrap();

        mock.tick();
        let status = mock.current_status().await.unwrap();
        assert_eq!(status.temp_bed.actual, 0.0);
    }

    #[tokio::test]
    async fn test_transport_fault_injection() {
        let mock = manual_mock();
        mock.connect().await.unwrap();
        mock.inject_transport_faults(1);

        let err = mock.current_status().await.unwrap_err();
        assert!(err.is_transport());

        assert!(mock.current_status().await.is_ok());
    }
}
