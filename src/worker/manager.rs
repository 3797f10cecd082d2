//! Worker manager: lifecycle of printer workers.
//!
//! Process-wide map from printer id to a running worker. The map is mutated
//! only here; the API reads through accessor methods. On startup the map is
//! rebuilt from the store's active printers, so a restart resumes
//! reconciliation without operator intervention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::driver::{Driver, MockSettings};
use crate::models::Printer;
use crate::store::Store;
use crate::task::PeriodicTask;
use crate::twin::TwinClient;

use super::{LatestPrinterStatus, PrinterWorker, StatusSlot, WorkerEvent};

/// Per-worker tunables pulled out of the full settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interval_secs: f64,
    pub match_tolerance_secs: f64,
    pub mock: MockSettings,
}

impl From<&Settings> for WorkerSettings {
    fn from(settings: &Settings) -> WorkerSettings {
        WorkerSettings {
            interval_secs: settings.printer_worker_interval,
            match_tolerance_secs: settings.job_match_tolerance_secs,
            mock: MockSettings {
                interval_secs: settings.mock_printer_interval,
                job_time: settings.mock_printer_job_time,
                bed_target: f64::from(settings.mock_printer_target_bed_temperature),
                nozzle_target: f64::from(settings.mock_printer_target_nozzle_temperature),
            },
        }
    }
}

struct WorkerHandle {
    events: mpsc::UnboundedSender<WorkerEvent>,
    status: StatusSlot,
    task: PeriodicTask,
}

pub struct WorkerManager {
    store: Arc<Store>,
    twin: Arc<TwinClient>,
    http: reqwest::Client,
    settings: WorkerSettings,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
}

impl WorkerManager {
    pub fn new(
        store: Arc<Store>,
        twin: Arc<TwinClient>,
        http: reqwest::Client,
        settings: WorkerSettings,
    ) -> WorkerManager {
        WorkerManager {
            store,
            twin,
            http,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a worker for the printer. Idempotent: an existing worker wins.
    /// Returns true when a new worker was started.
    pub fn start_new(&self, printer: &Printer) -> bool {
        let Ok(mut workers) = self.workers.lock() else {
            warn!(printer = printer.id, "worker map mutex poisoned; not starting worker");
            return false;
        };
        if workers.contains_key(&printer.id) {
            return false;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status: StatusSlot = Arc::new(RwLock::new(None));
        let driver = Driver::for_printer(printer, &self.http, &self.settings.mock);

        let worker = PrinterWorker::new(
            printer.clone(),
            Arc::clone(&self.store),
            driver,
            Arc::clone(&self.twin),
            events_rx,
            Duration::from_secs_f64(self.settings.interval_secs.max(0.1)),
            self.settings.match_tolerance_secs,
            Arc::clone(&status),
        );

        let task = PeriodicTask::start(
            worker,
            Duration::from_secs_f64(self.settings.interval_secs.max(0.1)),
        );

        workers.insert(
            printer.id,
            WorkerHandle {
                events: events_tx,
                status,
                task,
            },
        );

        info!(printer = printer.id, url = %printer.url, "worker started");
        true
    }

    /// Stop and remove the printer's worker. Idempotent; returns true when
    /// a worker was actually stopped.
    pub async fn stop(&self, printer_id: i64) -> bool {
        let handle = {
            let Ok(mut workers) = self.workers.lock() else {
                warn!(printer = printer_id, "worker map mutex poisoned; cannot stop worker");
                return false;
            };
            workers.remove(&printer_id)
        };

        match handle {
            Some(handle) => {
                handle.task.stop().await;
                info!(printer = printer_id, "worker stopped");
                true
            }
            None => false,
        }
    }

    pub fn has_worker(&self, printer_id: i64) -> bool {
        self.workers
            .lock()
            .map(|workers| workers.contains_key(&printer_id))
            .unwrap_or(false)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|workers| workers.len()).unwrap_or(0)
    }

    /// Latest enriched observation published by the printer's worker.
    pub fn get_status(&self, printer_id: i64) -> Option<LatestPrinterStatus> {
        let workers = self.workers.lock().ok()?;
        let handle = workers.get(&printer_id)?;
        let status = handle.status.read().ok()?.clone();
        status
    }

    /// Deliver a control event to the printer's worker queue.
    pub fn send_event(&self, printer_id: i64, event: WorkerEvent) -> bool {
        let Ok(workers) = self.workers.lock() else {
            warn!(printer = printer_id, "worker map mutex poisoned; dropping event");
            return false;
        };
        match workers.get(&printer_id) {
            Some(handle) => handle.events.send(event).is_ok(),
            None => false,
        }
    }

    /// Boot workers for every active printer. Returns how many started.
    pub fn start_all(&self) -> usize {
        let printers = match self.store.active_printers() {
            Ok(printers) => printers,
            Err(err) => {
                warn!(error = %err, "cannot list active printers; no workers started");
                return 0;
            }
        };

        let mut started = 0;
        for printer in &printers {
            if self.start_new(printer) {
                started += 1;
            }
        }
        info!(count = started, "workers started from store");
        started
    }

    /// Stop every worker: cancel all loops first, then wait for each.
    pub async fn stop_all(&self) {
        let handles: Vec<(i64, WorkerHandle)> = {
            let Ok(mut workers) = self.workers.lock() else {
                warn!("worker map mutex poisoned; nothing to stop");
                return;
            };
            workers.drain().collect()
        };

        for (_, handle) in &handles {
            handle.task.cancel();
        }
        for (printer_id, handle) in handles {
            handle.task.stop().await;
            info!(printer = printer_id, "worker stopped");
        }
    }
}
