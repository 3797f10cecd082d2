//! Printer workers.
//!
//! One worker per managed printer, running as a periodic task. Each step
//! reconciles three views of the world: the job row the store says the
//! printer is working on, the state the printer actually reports, and the
//! twin object mirrored for operators. The worker never trusts its own
//! memory across ticks — everything is re-derived from store + printer, so
//! restarts and transient network loss converge without intervention.
//!
//! Control events ({Cancel, Pickup}) arrive on a FIFO queue and are drained
//! to empty once per step, before reconciliation. The API never injects
//! events for cancellation; it sets the durable `CancelIssued` flag instead,
//! which the next step observes. Direct events exist for externally
//! delivered pickup confirmation.

pub mod manager;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::driver::{gcode_basename, Driver, DriverError, LatestJob, PrinterState, PrinterStatus};
use crate::models::{Job, JobStatus, Printer};
use crate::store::{NewJob, Store, StoreError};
use crate::task::{PeriodicStep, StepError};
use crate::twin::{TwinClient, TwinPrinter};

/// Control events delivered to a worker's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Cancel,
    Pickup,
}

/// Driver status enriched with printer metadata, as served to the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPrinterStatus {
    pub name: Option<String>,
    pub model: Option<String>,
    pub url: String,
    pub camera_url: Option<String>,
    #[serde(flatten)]
    pub status: PrinterStatus,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("driver {operation}: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkerError {
    fn driver(operation: &'static str, source: DriverError) -> WorkerError {
        WorkerError::Driver { operation, source }
    }
}

/// Shared slot a worker publishes its latest enriched observation into.
pub type StatusSlot = Arc<RwLock<Option<LatestPrinterStatus>>>;

struct CachedStatus {
    status: PrinterStatus,
    fetched_at: Instant,
}

pub struct PrinterWorker {
    name: String,
    printer: Printer,
    store: Arc<Store>,
    driver: Driver,
    twin: Arc<TwinClient>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    /// Tick period; doubles as the status cache TTL.
    interval: Duration,
    match_tolerance: chrono::Duration,
    connected: bool,
    cache: Option<CachedStatus>,
    published: StatusSlot,
}

impl PrinterWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        printer: Printer,
        store: Arc<Store>,
        driver: Driver,
        twin: Arc<TwinClient>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        interval: Duration,
        match_tolerance_secs: f64,
        published: StatusSlot,
    ) -> PrinterWorker {
        PrinterWorker {
            name: format!("printer-worker-{}", printer.id),
            printer,
            store,
            driver,
            twin,
            events,
            interval,
            match_tolerance: chrono::Duration::milliseconds(
                (match_tolerance_secs * 1000.0) as i64,
            ),
            connected: false,
            cache: None,
            published,
        }
    }

    // -----------------------------------------------------------------------
    // Step cycle
    // -----------------------------------------------------------------------

    async fn run_step(&mut self) -> Result<(), StepError> {
        if !self.connected {
            self.driver.connect().await?;
            self.connected = true;
        }

        // 1. Observe. A transport failure skips the whole tick and
        //    invalidates the cache; nothing else moves.
        let status = match self.printer_status().await {
            Ok(status) => status,
            Err(err) => {
                self.cache = None;
                return Err(err.into());
            }
        };

        // 2. Mirror (advisory; failures logged, never blocking).
        self.publish(&status);
        self.mirror(&status).await;

        // 3. Load the job the store believes occupies this printer.
        let mut job = self.store.current_printer_job(self.printer.id)?;

        // 4. Drain control events, oldest first.
        job = self.drain_events(job).await?;

        // 5. Reconcile.
        if let Err(err) = self.handle(job, &status).await {
            match err {
                WorkerError::Driver { operation, source } if source.is_transport() => {
                    warn!(
                        printer = self.printer.id,
                        operation,
                        error = %source,
                        "driver call failed; retrying next tick"
                    );
                }
                WorkerError::Driver { operation, source } => {
                    error!(
                        printer = self.printer.id,
                        operation,
                        error = %source,
                        "driver call failed; state unchanged"
                    );
                }
                WorkerError::Store(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Last observation if fresh, else a new fetch. TTL is the tick period,
    /// bounding driver calls to roughly one per tick.
    async fn printer_status(&mut self) -> Result<PrinterStatus, DriverError> {
        if let Some(cache) = &self.cache {
            if cache.fetched_at.elapsed() < self.interval {
                return Ok(cache.status.clone());
            }
        }

        let status = self.driver.current_status().await?;
        self.cache = Some(CachedStatus {
            status: status.clone(),
            fetched_at: Instant::now(),
        });
        Ok(status)
    }

    fn publish(&self, status: &PrinterStatus) {
        let enriched = LatestPrinterStatus {
            name: self.printer.opcua_name.clone(),
            model: self.printer.model.clone(),
            url: self.printer.url.clone(),
            camera_url: self.printer.camera_url.clone(),
            status: status.clone(),
        };
        if let Ok(mut slot) = self.published.write() {
            *slot = Some(enriched);
        }
    }

    async fn mirror(&self, status: &PrinterStatus) {
        let Some(twin_name) = &self.printer.opcua_name else {
            return;
        };

        let doc = TwinPrinter::from_status(&self.printer, status);
        if let Err(err) = self.twin.update(twin_name, doc) {
            warn!(printer = self.printer.id, error = %err, "twin update failed");
            return;
        }
        if let Err(err) = self.twin.commit().await {
            warn!(printer = self.printer.id, error = %err, "twin commit failed");
        }
    }

    // -----------------------------------------------------------------------
    // Event queue
    // -----------------------------------------------------------------------

    async fn drain_events(&mut self, mut job: Option<Job>) -> Result<Option<Job>, StoreError> {
        let mut queued = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            queued.push(event);
        }

        for event in queued {
            match event {
                WorkerEvent::Cancel => match job.as_mut() {
                    Some(current) => match self.on_cancel(current).await {
                        Ok(()) => {}
                        Err(WorkerError::Store(err)) => return Err(err),
                        Err(err) => {
                            warn!(printer = self.printer.id, error = %err, "cancel event failed");
                        }
                    },
                    None => {
                        warn!(printer = self.printer.id, "cancel event with no current job");
                    }
                },
                WorkerEvent::Pickup => match job.take() {
                    Some(mut current) => {
                        self.on_pick(&mut current)?;
                    }
                    None => {
                        warn!(printer = self.printer.id, "pickup event with no current job");
                    }
                },
            }
        }

        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    async fn handle(
        &mut self,
        job: Option<Job>,
        status: &PrinterStatus,
    ) -> Result<(), WorkerError> {
        let Some(mut job) = job else {
            // No tracked job. A printing printer means someone started a job
            // behind our back; adopt it so the farm sees it.
            if status.state.is_printing() {
                if let Some(lj) = &status.latest_job {
                    return self.adopt_job(lj).await;
                }
            }
            return Ok(());
        };

        if status.state.is_error() {
            error!(
                printer = self.printer.id,
                job = job.id,
                "printer is in error state; holding job"
            );
            return Ok(());
        }

        let matched = status
            .latest_job
            .as_ref()
            .filter(|lj| self.same_job(&job, lj, status.state));

        if matched.is_some() {
            self.drive_job(&mut job, status, matched).await
        } else if job.is_pending() && status.state.is_ready() {
            self.launch_server_job(&mut job).await
        } else if status.state.is_printing() && status.latest_job.is_some() {
            // Printer is busy with a different file: the tracked job was
            // taken off the bed (or replaced). Drop our claim; the next tick
            // adopts whatever is actually printing.
            self.on_displaced(&mut job).await
        } else {
            self.drive_job(&mut job, status, None).await
        }
    }

    /// "Same job" check: equal printer-side filename, and when the printer
    /// is actively printing with a known start time on both sides, the
    /// starts must agree within the configured tolerance.
    fn same_job(&self, job: &Job, lj: &LatestJob, state: PrinterState) -> bool {
        match job.gcode_filename() {
            Some(name) if name == lj.file_path => {}
            _ => return false,
        }

        let Some(job_start) = job.start_time else {
            return true;
        };
        if state != PrinterState::Printing || lj.done() {
            // time_used freezes once the print ends or pauses; the derived
            // start would drift and misreport a displaced job.
            return true;
        }

        let lj_start = Utc::now() - chrono::Duration::milliseconds((lj.time_used * 1000.0) as i64);
        (job_start - lj_start).abs() <= self.match_tolerance
    }

    /// Sub-state machine for a job that matches the printer's current job
    /// (or has no printer-side counterpart left).
    async fn drive_job(
        &mut self,
        job: &mut Job,
        status: &PrinterStatus,
        matched: Option<&LatestJob>,
    ) -> Result<(), WorkerError> {
        if job.need_pickup() {
            self.when_printed(job).await
        } else if job.need_cancel() {
            self.on_cancel(job).await
        } else if job.is_printing() {
            self.when_printing(job, matched)
        } else if job.is_printed() {
            // Pickup already issued; nothing to do until the Pickup event.
            Ok(())
        } else if job.is_pending() {
            // The print was started but the status write never landed
            // (crash between start_job and update_job). Converge.
            if let Some(lj) = matched {
                if status.state.is_printing() {
                    job.start_time = Some(
                        Utc::now()
                            - chrono::Duration::milliseconds((lj.time_used * 1000.0) as i64),
                    );
                    self.store.update_job(job, Some(JobStatus::PRINTING))?;
                    info!(
                        printer = self.printer.id,
                        job = job.id,
                        "recovered in-flight print for pending job"
                    );
                }
            }
            Ok(())
        } else {
            debug!(
                printer = self.printer.id,
                job = job.id,
                status = %job.status,
                "no reconciliation action"
            );
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Sub-operations
    // -----------------------------------------------------------------------

    /// Upload and start a pending server job on an idle printer.
    async fn launch_server_job(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        if !job.from_server {
            error!(
                printer = self.printer.id,
                job = job.id,
                "pending job is not server-managed; cannot launch"
            );
            return Ok(());
        }
        let Some(path) = job.gcode_file_path.clone() else {
            error!(
                printer = self.printer.id,
                job = job.id,
                "server job has no gcode file; cannot launch"
            );
            return Ok(());
        };

        match self.driver.upload_file(&path).await {
            // A leftover from an earlier partially-failed launch is fine.
            Ok(()) | Err(DriverError::FileAlreadyExists) => {}
            Err(source) => return Err(WorkerError::driver("upload_file", source)),
        }

        self.driver
            .start_job(&path)
            .await
            .map_err(|source| WorkerError::driver("start_job", source))?;

        job.printer_filename = Some(gcode_basename(&path));
        job.start_time = Some(Utc::now());
        self.store.update_job(job, Some(JobStatus::PRINTING))?;

        info!(
            printer = self.printer.id,
            job = job.id,
            file = %gcode_basename(&path),
            "print started"
        );
        Ok(())
    }

    /// The printer reports no such job anymore, or 100% completion.
    fn when_printing(&self, job: &mut Job, matched: Option<&LatestJob>) -> Result<(), WorkerError> {
        let finished = match matched {
            Some(lj) => lj.done(),
            None => true,
        };

        if finished {
            self.store.update_job(job, Some(JobStatus::PRINTED))?;
            info!(printer = self.printer.id, job = job.id, "print finished");
        }
        Ok(())
    }

    /// Clean up a finished server job's gcode and request pickup.
    async fn when_printed(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        if job.from_server {
            if let Some(name) = job.gcode_filename() {
                match self.driver.delete_file(&name).await {
                    // Already gone (e.g. a retry after a partial failure).
                    Ok(()) | Err(DriverError::NotFound) => {}
                    Err(source) => return Err(WorkerError::driver("delete_file", source)),
                }
            }
        }

        self.require_pickup(job)
    }

    /// Signal the external pickup system and record that we did.
    fn require_pickup(&self, job: &mut Job) -> Result<(), WorkerError> {
        info!(
            printer = self.printer.id,
            job = job.id,
            url = %self.printer.url,
            "pickup requested for printed model"
        );
        self.store.update_job(job, Some(JobStatus::PICKUP_ISSUED))?;
        Ok(())
    }

    /// Honor a cancel: stop the physical print if one is running, then mark
    /// the job cancelled. The model stays on the bed until picked.
    async fn on_cancel(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        if job.is_printing() {
            self.driver
                .stop_job()
                .await
                .map_err(|source| WorkerError::driver("stop_job", source))?;
        }

        self.store.update_job(job, Some(JobStatus::CANCELLED))?;
        info!(printer = self.printer.id, job = job.id, "job cancelled");
        Ok(())
    }

    /// Pickup confirmed: the job is terminal and the printer is free.
    fn on_pick(&self, job: &mut Job) -> Result<(), StoreError> {
        self.store.update_job(job, Some(JobStatus::PICKED))?;
        info!(printer = self.printer.id, job = job.id, "printed model picked up");
        Ok(())
    }

    /// The printer is busy with a file we do not track against this job.
    async fn on_displaced(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        warn!(
            printer = self.printer.id,
            job = job.id,
            "printer is busy with a different file; dropping tracked job"
        );
        self.store.update_job(job, Some(JobStatus::PICKED))?;
        Ok(())
    }

    /// Create a job row for a print this system did not start.
    async fn adopt_job(&self, lj: &LatestJob) -> Result<(), WorkerError> {
        let start_time =
            Utc::now() - chrono::Duration::milliseconds((lj.time_used * 1000.0) as i64);

        let job = self.store.create_job(NewJob {
            printer_id: Some(self.printer.id),
            status: JobStatus::SCHEDULED | JobStatus::PRINTING,
            from_server: false,
            printer_filename: Some(lj.file_path.clone()),
            start_time: Some(start_time),
            ..NewJob::default()
        })?;

        info!(
            printer = self.printer.id,
            job = job.id,
            file = %lj.file_path,
            "adopted job already running on printer"
        );
        Ok(())
    }
}

impl PeriodicStep for PrinterWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) {
        if let Some(mock) = self.driver.as_mock() {
            mock.start();
        }
    }

    async fn step(&mut self) -> Result<(), StepError> {
        self.run_step().await
    }

    async fn teardown(&mut self) {
        if let Some(mock) = self.driver.as_mock() {
            mock.shutdown();
        }
        if let Ok(mut slot) = self.published.write() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::driver::{MockDriver, MockSettings};
    use crate::models::PrinterApi;
    use crate::store::NewPrinter;

    /// Mock heats in two ticks (targets 20/20 at +10 per tick) and prints
    /// for three more.
    const JOB_TIME: u32 = 3;
    const HEATING_TICKS: u32 = 2;

    fn test_store() -> Arc<Store> {
        Arc::new(Store::new(db::test_db()))
    }

    fn seed_printer(store: &Store) -> Printer {
        store
            .create_printer(NewPrinter {
                url: "http://mock-printer".into(),
                api_key: None,
                api: PrinterApi::Mock,
                group_name: None,
                active: true,
                opcua_name: Some("Printer1".into()),
                camera_url: None,
                model: Some("Mock MK1".into()),
            })
            .expect("create printer")
    }

    struct Harness {
        store: Arc<Store>,
        twin: Arc<TwinClient>,
        printer: Printer,
        worker: PrinterWorker,
        events: mpsc::UnboundedSender<WorkerEvent>,
        published: StatusSlot,
    }

    fn harness() -> Harness {
        let store = test_store();
        let twin = Arc::new(TwinClient::in_memory());
        let printer = seed_printer(&store);

        let driver = Driver::Mock(MockDriver::new(MockSettings {
            interval_secs: 0.0,
            job_time: JOB_TIME,
            bed_target: 20.0,
            nozzle_target: 20.0,
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let published: StatusSlot = Arc::new(RwLock::new(None));

        let worker = PrinterWorker::new(
            printer.clone(),
            Arc::clone(&store),
            driver,
            Arc::clone(&twin),
            rx,
            Duration::ZERO,
            10.0,
            Arc::clone(&published),
        );

        Harness {
            store,
            twin,
            printer,
            worker,
            events: tx,
            published,
        }
    }

    fn pending_server_job(h: &Harness) -> Job {
        h.store
            .create_job(NewJob {
                printer_id: Some(h.printer.id),
                status: JobStatus::TO_PRINT,
                from_server: true,
                gcode_file_path: Some("/srv/upload/server-s1.gcode".into()),
                original_filename: Some("A.gcode".into()),
                ..NewJob::default()
            })
            .expect("create job")
    }

    fn mock(h: &Harness) -> &MockDriver {
        h.worker.driver.as_mock().expect("mock driver")
    }

    async fn step(h: &mut Harness) {
        h.worker.run_step().await.expect("worker step");
    }

    async fn tick_and_step(h: &mut Harness) {
        mock(h).tick();
        h.worker.run_step().await.expect("worker step");
    }

    #[tokio::test]
    async fn test_server_job_happy_path() {
        let mut h = harness();
        let job = pending_server_job(&h);

        // First step launches: upload + start + Printing.
        step(&mut h).await;
        let launched = h.store.get_job(job.id).unwrap().unwrap();
        assert!(launched.status.contains(JobStatus::PRINTING));
        assert_eq!(
            launched.printer_filename.as_deref(),
            Some("server-s1.gcode")
        );
        assert_eq!(mock(&h).files(), vec!["server-s1.gcode".to_string()]);

        // Heat, print, finish, delete, request pickup.
        for _ in 0..(HEATING_TICKS + JOB_TIME + 2) {
            tick_and_step(&mut h).await;
        }

        let done = h.store.get_job(job.id).unwrap().unwrap();
        assert!(done.status.contains(JobStatus::PRINTING));
        assert!(done.status.contains(JobStatus::PRINTED));
        assert!(done.status.contains(JobStatus::PICKUP_ISSUED));
        assert!(mock(&h).files().is_empty(), "gcode not deleted from printer");

        // Still the printer's current job until picked.
        let current = h.store.current_printer_job(h.printer.id).unwrap().unwrap();
        assert_eq!(current.id, job.id);
    }

    #[tokio::test]
    async fn test_external_job_adoption() {
        let mut h = harness();

        {
            let m = mock(&h);
            m.connect().await.unwrap();
            m.upload_file("X.gcode").await.unwrap();
            m.start_job("X.gcode").await.unwrap();
            m.tick();
        }

        step(&mut h).await;

        let adopted = h.store.current_printer_job(h.printer.id).unwrap().unwrap();
        assert!(!adopted.from_server);
        assert_eq!(adopted.printer_filename.as_deref(), Some("X.gcode"));
        assert_eq!(
            adopted.status,
            JobStatus::SCHEDULED | JobStatus::PRINTING
        );
        assert!(adopted.start_time.is_some());

        // A second step must not adopt a duplicate.
        step(&mut h).await;
        assert!(h.store.current_printer_job(h.printer.id).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_during_printing() {
        let mut h = harness();
        let job = pending_server_job(&h);

        step(&mut h).await;
        tick_and_step(&mut h).await;

        // Cancel arrives out-of-band as a durable flag.
        let mut printing = h.store.get_job(job.id).unwrap().unwrap();
        h.store
            .update_job(&mut printing, Some(JobStatus::CANCEL_ISSUED))
            .unwrap();

        tick_and_step(&mut h).await;

        let cancelled = h.store.get_job(job.id).unwrap().unwrap();
        assert!(cancelled.status.contains(JobStatus::CANCELLED));

        // The physical print was stopped.
        mock(&h).tick();
        let status = mock(&h).current_status().await.unwrap();
        assert_eq!(status.state, PrinterState::Ready);

        // Still on the bed until picked.
        let current = h.store.current_printer_job(h.printer.id).unwrap().unwrap();
        assert_eq!(current.id, job.id);
    }

    #[tokio::test]
    async fn test_printer_displaces_tracked_job() {
        let mut h = harness();

        // Tracked job believes it is printing "A.gcode".
        let job = h
            .store
            .create_job(NewJob {
                printer_id: Some(h.printer.id),
                status: JobStatus::TO_PRINT | JobStatus::PRINTING,
                from_server: false,
                printer_filename: Some("A.gcode".into()),
                ..NewJob::default()
            })
            .unwrap();

        // The printer is actually running "B.gcode".
        {
            let m = mock(&h);
            m.connect().await.unwrap();
            m.upload_file("B.gcode").await.unwrap();
            m.start_job("B.gcode").await.unwrap();
            m.tick();
        }

        step(&mut h).await;
        let displaced = h.store.get_job(job.id).unwrap().unwrap();
        assert!(displaced.status.contains(JobStatus::PICKED));

        // Next tick adopts the job actually on the printer.
        step(&mut h).await;
        let adopted = h.store.current_printer_job(h.printer.id).unwrap().unwrap();
        assert_ne!(adopted.id, job.id);
        assert_eq!(adopted.printer_filename.as_deref(), Some("B.gcode"));
    }

    #[tokio::test]
    async fn test_transient_transport_error_skips_tick() {
        let mut h = harness();
        let job = pending_server_job(&h);

        mock(&h).inject_transport_faults(1);

        let err = h.worker.run_step().await.unwrap_err();
        assert!(err.transient);
        assert!(h.worker.cache.is_none());

        // No store writes happened.
        let unchanged = h.store.get_job(job.id).unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::TO_PRINT);

        // Next tick resumes normally and launches.
        step(&mut h).await;
        let launched = h.store.get_job(job.id).unwrap().unwrap();
        assert!(launched.status.contains(JobStatus::PRINTING));
    }

    #[tokio::test]
    async fn test_pickup_event_completes_job() {
        let mut h = harness();
        let job = pending_server_job(&h);

        step(&mut h).await;
        for _ in 0..(HEATING_TICKS + JOB_TIME + 2) {
            tick_and_step(&mut h).await;
        }
        assert!(h
            .store
            .get_job(job.id)
            .unwrap()
            .unwrap()
            .status
            .contains(JobStatus::PICKUP_ISSUED));

        h.events.send(WorkerEvent::Pickup).unwrap();
        tick_and_step(&mut h).await;

        let picked = h.store.get_job(job.id).unwrap().unwrap();
        assert!(picked.status.contains(JobStatus::PICKED));
        assert!(h.store.current_printer_job(h.printer.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_event_with_no_job_is_harmless() {
        let mut h = harness();
        h.events.send(WorkerEvent::Cancel).unwrap();
        step(&mut h).await;
        assert!(h.store.current_printer_job(h.printer.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_published_and_twin_mirrored() {
        let mut h = harness();
        step(&mut h).await;

        let published = h.published.read().unwrap().clone().unwrap();
        assert_eq!(published.url, h.printer.url);
        assert_eq!(published.model.as_deref(), Some("Mock MK1"));
        assert_eq!(published.status.state, PrinterState::Ready);

        let doc = h.twin.get("Printer1").unwrap().unwrap();
        assert_eq!(doc.state, "ready");
        assert_eq!(doc.model, "Mock MK1");
    }

    #[tokio::test]
    async fn test_cancel_of_scheduled_job_needs_no_stop() {
        let mut h = harness();
        let job = pending_server_job(&h);

        // Cancel before the worker ever launched it.
        let mut pending = h.store.get_job(job.id).unwrap().unwrap();
        h.store
            .update_job(&mut pending, Some(JobStatus::CANCEL_ISSUED))
            .unwrap();

        step(&mut h).await;

        let cancelled = h.store.get_job(job.id).unwrap().unwrap();
        assert!(cancelled.status.contains(JobStatus::CANCELLED));
        // Never printed, so nothing was uploaded or started.
        assert!(mock(&h).files().is_empty());
    }
}
