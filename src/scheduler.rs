//! FIFO scheduler.
//!
//! A periodic task that matches approved server jobs to idle printers,
//! oldest job first. The scheduler only proposes assignments; the owning
//! worker validates readiness on its next tick. Idleness is judged against
//! every unfinished job (scheduled through cancelled-on-bed), keeping the
//! one-job-per-printer invariant intact.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::models::JobStatus;
use crate::store::Store;
use crate::task::{PeriodicStep, StepError};

pub struct FifoScheduler {
    name: String,
    store: Arc<Store>,
    /// When false, only jobs already carrying a printer assignment are
    /// promoted; FIFO assignment of unassigned jobs is disabled.
    auto_schedule: bool,
}

impl FifoScheduler {
    pub fn new(store: Arc<Store>, auto_schedule: bool) -> FifoScheduler {
        FifoScheduler {
            name: "fifo-scheduler".to_string(),
            store,
            auto_schedule,
        }
    }

    async fn schedule(&self) -> Result<(), StepError> {
        let mut busy: HashSet<i64> = self.store.occupied_printer_ids()?.into_iter().collect();
        let workered: Vec<i64> = self
            .store
            .active_printers()?
            .iter()
            .map(|p| p.id)
            .collect();

        // Jobs submitted against a specific printer skip FIFO assignment
        // and are promoted as soon as their printer is free.
        for mut job in self.store.assigned_unscheduled_jobs()? {
            let Some(printer_id) = job.printer_id else {
                continue;
            };
            if !workered.contains(&printer_id) || busy.contains(&printer_id) {
                continue;
            }

            self.store.update_job(&mut job, Some(JobStatus::SCHEDULED))?;
            busy.insert(printer_id);
            info!(job = job.id, printer = printer_id, "scheduled pre-assigned job");
        }

        if !self.auto_schedule {
            return Ok(());
        }

        let unscheduled = self.store.unscheduled_jobs()?;
        if unscheduled.is_empty() {
            return Ok(());
        }

        let mut idle = workered.iter().copied().filter(|id| !busy.contains(id));

        for mut job in unscheduled {
            let Some(printer_id) = idle.next() else {
                debug!("no idle printers left this tick");
                break;
            };

            job.printer_id = Some(printer_id);
            self.store.update_job(&mut job, Some(JobStatus::SCHEDULED))?;
            info!(job = job.id, printer = printer_id, "scheduled job");
        }

        Ok(())
    }
}

impl PeriodicStep for FifoScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) {}

    async fn step(&mut self) -> Result<(), StepError> {
        self.schedule().await
    }

    async fn teardown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{Job, PrinterApi};
    use crate::store::{NewJob, NewPrinter};

    fn scheduler(auto: bool) -> (FifoScheduler, Arc<Store>) {
        let store = Arc::new(Store::new(db::test_db()));
        (FifoScheduler::new(Arc::clone(&store), auto), store)
    }

    fn seed_printer(store: &Store, url: &str, active: bool) -> i64 {
        store
            .create_printer(NewPrinter {
                url: url.into(),
                api_key: None,
                api: PrinterApi::Mock,
                group_name: None,
                active,
                opcua_name: None,
                camera_url: None,
                model: None,
            })
            .unwrap()
            .id
    }

    fn seed_unassigned_job(store: &Store) -> Job {
        store
            .create_job(NewJob {
                status: JobStatus::TO_SCHEDULE,
                from_server: true,
                gcode_file_path: Some("/srv/upload/server-x.gcode".into()),
                ..NewJob::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_fifo_assignment() {
        let (scheduler, store) = scheduler(true);
        let p1 = seed_printer(&store, "http://p1", true);
        let p2 = seed_printer(&store, "http://p2", true);

        let j1 = seed_unassigned_job(&store);
        let j2 = seed_unassigned_job(&store);
        let j3 = seed_unassigned_job(&store);

        scheduler.schedule().await.unwrap();

        let j1 = store.get_job(j1.id).unwrap().unwrap();
        let j2 = store.get_job(j2.id).unwrap().unwrap();
        let j3 = store.get_job(j3.id).unwrap().unwrap();

        assert_eq!(j1.printer_id, Some(p1));
        assert_eq!(j1.status, JobStatus::TO_PRINT);
        assert_eq!(j2.printer_id, Some(p2));
        assert_eq!(j2.status, JobStatus::TO_PRINT);

        // Oldest jobs go first; the third waits for a free printer.
        assert_eq!(j3.printer_id, None);
        assert_eq!(j3.status, JobStatus::TO_SCHEDULE);
    }

    #[tokio::test]
    async fn test_no_jobs_is_a_no_op() {
        let (scheduler, store) = scheduler(true);
        seed_printer(&store, "http://p1", true);
        scheduler.schedule().await.unwrap();
        assert!(store.scheduled_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_printers_are_skipped() {
        let (scheduler, store) = scheduler(true);
        let p1 = seed_printer(&store, "http://p1", true);
        let p2 = seed_printer(&store, "http://p2", true);

        // p1 is printing.
        store
            .create_job(NewJob {
                printer_id: Some(p1),
                status: JobStatus::TO_PRINT | JobStatus::PRINTING,
                from_server: true,
                gcode_file_path: Some("/srv/upload/server-busy.gcode".into()),
                ..NewJob::default()
            })
            .unwrap();

        let job = seed_unassigned_job(&store);
        scheduler.schedule().await.unwrap();

        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.printer_id, Some(p2));
    }

    #[tokio::test]
    async fn test_cancelled_on_bed_blocks_printer() {
        let (scheduler, store) = scheduler(true);
        let p1 = seed_printer(&store, "http://p1", true);

        // Cancelled but not picked: the bed is still occupied.
        store
            .create_job(NewJob {
                printer_id: Some(p1),
                status: JobStatus::TO_PRINT | JobStatus::PRINTING | JobStatus::CANCELLED,
                from_server: true,
                gcode_file_path: Some("/srv/upload/server-c.gcode".into()),
                ..NewJob::default()
            })
            .unwrap();

        let job = seed_unassigned_job(&store);
        scheduler.schedule().await.unwrap();

        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.printer_id, None);
    }

    #[tokio::test]
    async fn test_inactive_printers_are_not_candidates() {
        let (scheduler, store) = scheduler(true);
        seed_printer(&store, "http://p1", false);

        let job = seed_unassigned_job(&store);
        scheduler.schedule().await.unwrap();

        assert_eq!(store.get_job(job.id).unwrap().unwrap().printer_id, None);
    }

    #[tokio::test]
    async fn test_preassigned_job_is_promoted() {
        let (scheduler, store) = scheduler(false);
        let p1 = seed_printer(&store, "http://p1", true);

        let job = store
            .create_job(NewJob {
                printer_id: Some(p1),
                status: JobStatus::TO_SCHEDULE,
                from_server: true,
                gcode_file_path: Some("/srv/upload/server-pre.gcode".into()),
                ..NewJob::default()
            })
            .unwrap();

        scheduler.schedule().await.unwrap();

        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::TO_PRINT);
    }

    #[tokio::test]
    async fn test_auto_schedule_off_leaves_unassigned_jobs() {
        let (scheduler, store) = scheduler(false);
        seed_printer(&store, "http://p1", true);

        let job = seed_unassigned_job(&store);
        scheduler.schedule().await.unwrap();

        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.printer_id, None);
        assert_eq!(job.status, JobStatus::TO_SCHEDULE);
    }

    #[tokio::test]
    async fn test_each_assignment_targets_an_idle_printer_once() {
        let (scheduler, store) = scheduler(true);
        let p1 = seed_printer(&store, "http://p1", true);

        let j1 = seed_unassigned_job(&store);
        let j2 = seed_unassigned_job(&store);

        scheduler.schedule().await.unwrap();

        let j1 = store.get_job(j1.id).unwrap().unwrap();
        let j2 = store.get_job(j2.id).unwrap().unwrap();
        assert_eq!(j1.printer_id, Some(p1));
        assert_eq!(j2.printer_id, None, "one printer must not get two jobs");

        // Next tick: p1 now hosts a live pending job, still not idle.
        scheduler.schedule().await.unwrap();
        let j2 = store.get_job(j2.id).unwrap().unwrap();
        assert_eq!(j2.printer_id, None);
    }
}
