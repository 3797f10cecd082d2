//! Job/order store: every query and mutation the scheduler, workers, and
//! API need, over the shared SQLite handle.
//!
//! Discipline: one mutex-scoped unit of work per call. Mutations that add a
//! status flag insert the matching job history row inside the same
//! transaction, so the history invariant cannot be broken by a crash between
//! the two writes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbState;
use crate::models::{Job, JobHistory, JobStatus, Order, Printer, PrinterApi, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("database mutex poisoned")]
    Poisoned,
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("invalid column value: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// New-row payloads. Ids and creation timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPrinter {
    pub url: String,
    pub api_key: Option<String>,
    pub api: PrinterApi,
    pub group_name: Option<String>,
    pub active: bool,
    pub opcua_name: Option<String>,
    pub camera_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub order_id: Option<i64>,
    pub user_id: Option<String>,
    pub printer_id: Option<i64>,
    pub status: JobStatus,
    pub from_server: bool,
    pub gcode_file_path: Option<String>,
    pub original_filename: Option<String>,
    pub printer_filename: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

pub struct Store {
    db: DbState,
}

const JOB_COLUMNS: &str = "id, order_id, user_id, printer_id, status, from_server, \
     gcode_file_path, original_filename, printer_filename, start_time, create_time";

const PRINTER_COLUMNS: &str =
    "id, url, api_key, api, group_name, active, opcua_name, camera_url, model, create_time";

impl Store {
    pub fn new(db: DbState) -> Store {
        Store { db }
    }

    fn conn(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.db.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub fn create_user(&self, id: &str, name: &str, role: &str) -> StoreResult<User> {
        let conn = self.conn()?;
        let now = now_string();
        conn.execute(
            "INSERT INTO users (id, name, role, create_time) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, role, now],
        )?;
        Ok(User {
            id: id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            create_time: parse_time(&now)?,
        })
    }

    pub fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, role, create_time FROM users WHERE id = ?1",
            params![id],
            map_user,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn user_exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.get_user(id)?.is_some())
    }

    pub fn all_users(&self) -> StoreResult<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, role, create_time FROM users ORDER BY id")?;
        let rows = stmt.query_map([], map_user)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Printers
    // -----------------------------------------------------------------------

    pub fn create_printer(&self, new: NewPrinter) -> StoreResult<Printer> {
        let conn = self.conn()?;
        let now = now_string();
        conn.execute(
            "INSERT INTO printers (url, api_key, api, group_name, active, opcua_name,
                                   camera_url, model, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.url,
                new.api_key,
                new.api.as_str(),
                new.group_name,
                new.active,
                new.opcua_name,
                new.camera_url,
                new.model,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Printer {
            id,
            url: new.url,
            api_key: new.api_key,
            api: new.api,
            group_name: new.group_name,
            active: new.active,
            opcua_name: new.opcua_name,
            camera_url: new.camera_url,
            model: new.model,
            create_time: parse_time(&now)?,
        })
    }

    pub fn get_printer(&self, id: i64) -> StoreResult<Option<Printer>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PRINTER_COLUMNS} FROM printers WHERE id = ?1"),
            params![id],
            map_printer,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// List printers, optionally filtered by group and/or active flag.
    pub fn printers(
        &self,
        group_name: Option<&str>,
        active: Option<bool>,
    ) -> StoreResult<Vec<Printer>> {
        let conn = self.conn()?;

        match (group_name, active) {
            (Some(group), Some(active)) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRINTER_COLUMNS} FROM printers
                     WHERE group_name = ?1 AND active = ?2 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![group, active], map_printer)?;
                collect_rows(rows)
            }
            (Some(group), None) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRINTER_COLUMNS} FROM printers WHERE group_name = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![group], map_printer)?;
                collect_rows(rows)
            }
            (None, Some(active)) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRINTER_COLUMNS} FROM printers WHERE active = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![active], map_printer)?;
                collect_rows(rows)
            }
            (None, None) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRINTER_COLUMNS} FROM printers ORDER BY id"
                ))?;
                let rows = stmt.query_map([], map_printer)?;
                collect_rows(rows)
            }
        }
    }

    /// Printers whose `active` flag is set: a worker should run for each.
    pub fn active_printers(&self) -> StoreResult<Vec<Printer>> {
        self.printers(None, Some(true))
    }

    /// Flip the `active` flag; returns the updated row.
    pub fn set_printer_active(&self, id: i64, active: bool) -> StoreResult<Printer> {
        {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE printers SET active = ?1 WHERE id = ?2",
                params![active, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("printer"));
            }
        }
        self.get_printer(id)?.ok_or(StoreError::NotFound("printer"))
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub fn create_order(&self, user_id: &str, printer_id: Option<i64>) -> StoreResult<Order> {
        let conn = self.conn()?;
        let now = now_string();
        conn.execute(
            "INSERT INTO orders (user_id, printer_id, cancelled, create_time)
             VALUES (?1, ?2, 0, ?3)",
            params![user_id, printer_id, now],
        )?;
        Ok(Order {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            printer_id,
            cancelled: false,
            create_time: parse_time(&now)?,
        })
    }

    pub fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, printer_id, cancelled, create_time FROM orders WHERE id = ?1",
            params![id],
            map_order,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn all_orders(&self) -> StoreResult<Vec<Order>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, printer_id, cancelled, create_time FROM orders ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_order)?;
        collect_rows(rows)
    }

    pub fn user_orders(&self, user_id: &str) -> StoreResult<Vec<Order>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, printer_id, cancelled, create_time
             FROM orders WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], map_order)?;
        collect_rows(rows)
    }

    /// Approve an order: every job spawned by it gains `Approved`.
    pub fn approve_order(&self, order_id: i64) -> StoreResult<()> {
        let jobs = self.order_jobs(order_id)?;
        for mut job in jobs {
            if !job.status.contains(JobStatus::APPROVED) {
                self.update_job(&mut job, Some(JobStatus::APPROVED))?;
            }
        }
        Ok(())
    }

    /// Cancel an order: mark the row and issue a cancel on its live jobs.
    pub fn cancel_order(&self, order_id: i64) -> StoreResult<()> {
        {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE orders SET cancelled = 1 WHERE id = ?1",
                params![order_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound("order"));
            }
        }

        for mut job in self.order_jobs(order_id)? {
            let terminal = job.status.contains(JobStatus::PICKED)
                || job.status.contains(JobStatus::CANCELLED);
            if !terminal && !job.status.contains(JobStatus::CANCEL_ISSUED) {
                self.update_job(&mut job, Some(JobStatus::CANCEL_ISSUED))?;
            }
        }
        Ok(())
    }

    fn order_jobs(&self, order_id: i64) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE order_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![order_id], map_job)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert a job and one history row per status flag it starts with.
    pub fn create_job(&self, new: NewJob) -> StoreResult<Job> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_string();

        tx.execute(
            "INSERT INTO jobs (order_id, user_id, printer_id, status, from_server,
                               gcode_file_path, original_filename, printer_filename,
                               start_time, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new.order_id,
                new.user_id,
                new.printer_id,
                new.status.0,
                new.from_server,
                new.gcode_file_path,
                new.original_filename,
                new.printer_filename,
                new.start_time.map(|t| time_string(&t)),
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        for flag in all_flags() {
            if new.status.contains(flag) {
                tx.execute(
                    "INSERT INTO job_history (job_id, status, create_time) VALUES (?1, ?2, ?3)",
                    params![id, flag.flag_name(), now],
                )?;
            }
        }

        tx.commit()?;

        Ok(Job {
            id,
            order_id: new.order_id,
            user_id: new.user_id,
            printer_id: new.printer_id,
            status: new.status,
            from_server: new.from_server,
            gcode_file_path: new.gcode_file_path,
            original_filename: new.original_filename,
            printer_filename: new.printer_filename,
            start_time: new.start_time,
            create_time: parse_time(&now)?,
        })
    }

    /// Persist a job's mutable fields; when `new_flag` is given, add it to
    /// the bitmask and append the history row in the same transaction.
    pub fn update_job(&self, job: &mut Job, new_flag: Option<JobStatus>) -> StoreResult<()> {
        if let Some(flag) = new_flag {
            job.status |= flag;
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let changed = tx.execute(
            "UPDATE jobs SET printer_id = ?1, status = ?2, printer_filename = ?3,
                             start_time = ?4, gcode_file_path = ?5
             WHERE id = ?6",
            params![
                job.printer_id,
                job.status.0,
                job.printer_filename,
                job.start_time.map(|t| time_string(&t)),
                job.gcode_file_path,
                job.id
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("job"));
        }

        if let Some(flag) = new_flag {
            tx.execute(
                "INSERT INTO job_history (job_id, status, create_time) VALUES (?1, ?2, ?3)",
                params![job.id, flag.flag_name(), now_string()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> StoreResult<Option<Job>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            map_job,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn all_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))?;
        let rows = stmt.query_map([], map_job)?;
        collect_rows(rows)
    }

    pub fn get_job_history(&self, job_id: i64) -> StoreResult<Vec<JobHistory>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, status, create_time FROM job_history
             WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id], map_history)?;
        collect_rows(rows)
    }

    /// Jobs still waiting for approval.
    pub fn unapproved_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status < ?1 ORDER BY create_time, id"
        ))?;
        let rows = stmt.query_map(params![JobStatus::APPROVED.0], map_job)?;
        collect_rows(rows)
    }

    /// Approved server jobs with no printer yet, FIFO by creation time.
    pub fn unscheduled_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = ?1 AND printer_id IS NULL AND from_server = 1
             ORDER BY create_time, id"
        ))?;
        let rows = stmt.query_map(params![JobStatus::TO_SCHEDULE.0], map_job)?;
        collect_rows(rows)
    }

    /// Approved server jobs pre-assigned to a printer but not yet scheduled.
    pub fn assigned_unscheduled_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = ?1 AND printer_id IS NOT NULL AND from_server = 1
             ORDER BY create_time, id"
        ))?;
        let rows = stmt.query_map(params![JobStatus::TO_SCHEDULE.0], map_job)?;
        collect_rows(rows)
    }

    /// Jobs scheduled on a printer but not launched yet.
    pub fn scheduled_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = ?1 AND printer_id IS NOT NULL
             ORDER BY create_time, id"
        ))?;
        let rows = stmt.query_map(params![JobStatus::TO_PRINT.0], map_job)?;
        collect_rows(rows)
    }

    /// First pending job assigned to the printer.
    pub fn next_pending_job(&self, printer_id: i64) -> StoreResult<Option<Job>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE status = ?1 AND printer_id = ?2
                 ORDER BY id LIMIT 1"
            ),
            params![JobStatus::TO_PRINT.0, printer_id],
            map_job,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Printers currently hosting an unfinished job (scheduled, printing,
    /// printed, or cancelled-but-still-on-bed). The scheduler must not
    /// propose these.
    pub fn occupied_printer_ids(&self) -> StoreResult<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT printer_id FROM jobs
             WHERE printer_id IS NOT NULL AND status > ?1 AND (status & ?2) = 0
             ORDER BY printer_id",
        )?;
        let rows = stmt.query_map(
            params![JobStatus::SCHEDULED.0, JobStatus::PICKED.0],
            |row| row.get(0),
        )?;
        collect_rows(rows)
    }

    /// The single job occupying the printer: past `Scheduled`, not picked.
    ///
    /// Finding more than one is an invariant violation and reported as such
    /// rather than silently picking one.
    pub fn current_printer_job(&self, printer_id: i64) -> StoreResult<Option<Job>> {
        let jobs = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE printer_id = ?1 AND status > ?2 AND (status & ?3) = 0
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                params![printer_id, JobStatus::SCHEDULED.0, JobStatus::PICKED.0],
                map_job,
            )?;
            collect_rows(rows)?
        };

        match jobs.len() {
            0 => Ok(None),
            1 => Ok(jobs.into_iter().next()),
            n => Err(StoreError::Invariant(format!(
                "printer {printer_id} has {n} unfinished jobs"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Gcode file intake
    // -----------------------------------------------------------------------

    /// Generate a server-unique filename keeping the original extension.
    pub fn generate_gcode_filename(original: &str) -> String {
        let ext = Path::new(original)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gcode".to_string());
        format!("server-{}.{ext}", Uuid::new_v4().simple())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn now_string() -> String {
    time_string(&Utc::now())
}

fn time_string(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("timestamp {s:?}: {e}")))
}

fn decode_time(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        create_time: decode_time(row.get(3)?)?,
    })
}

fn map_printer(row: &Row<'_>) -> rusqlite::Result<Printer> {
    let api: String = row.get(3)?;
    Ok(Printer {
        id: row.get(0)?,
        url: row.get(1)?,
        api_key: row.get(2)?,
        api: PrinterApi::parse(&api).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown printer api {api:?}").into(),
            )
        })?,
        group_name: row.get(4)?,
        active: row.get(5)?,
        opcua_name: row.get(6)?,
        camera_url: row.get(7)?,
        model: row.get(8)?,
        create_time: decode_time(row.get(9)?)?,
    })
}

fn map_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        user_id: row.get(1)?,
        printer_id: row.get(2)?,
        cancelled: row.get(3)?,
        create_time: decode_time(row.get(4)?)?,
    })
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: u32 = row.get(4)?;
    let start_time: Option<String> = row.get(9)?;
    Ok(Job {
        id: row.get(0)?,
        order_id: row.get(1)?,
        user_id: row.get(2)?,
        printer_id: row.get(3)?,
        status: JobStatus(status),
        from_server: row.get(5)?,
        gcode_file_path: row.get(6)?,
        original_filename: row.get(7)?,
        printer_filename: row.get(8)?,
        start_time: start_time.map(decode_time).transpose()?,
        create_time: decode_time(row.get(10)?)?,
    })
}

fn map_history(row: &Row<'_>) -> rusqlite::Result<JobHistory> {
    Ok(JobHistory {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: row.get(2)?,
        create_time: decode_time(row.get(3)?)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> StoreResult<Vec<T>> {
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(StoreError::from)
}

fn all_flags() -> [JobStatus; 9] {
    [
        JobStatus::CREATED,
        JobStatus::APPROVED,
        JobStatus::SCHEDULED,
        JobStatus::PRINTING,
        JobStatus::PRINTED,
        JobStatus::PICKED,
        JobStatus::CANCELLED,
        JobStatus::PICKUP_ISSUED,
        JobStatus::CANCEL_ISSUED,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_store() -> Store {
        Store::new(db::test_db())
    }

    fn seed_printer(store: &Store, url: &str, active: bool) -> Printer {
        store
            .create_printer(NewPrinter {
                url: url.to_string(),
                api_key: None,
                api: PrinterApi::Mock,
                group_name: None,
                active,
                opcua_name: None,
                camera_url: None,
                model: None,
            })
            .expect("create printer")
    }

    fn seed_job(store: &Store, status: JobStatus, printer_id: Option<i64>) -> Job {
        store
            .create_job(NewJob {
                printer_id,
                status,
                from_server: true,
                gcode_file_path: Some("/tmp/upload/server-a.gcode".into()),
                original_filename: Some("a.gcode".into()),
                ..NewJob::default()
            })
            .expect("create job")
    }

    #[test]
    fn test_create_job_writes_history_per_flag() {
        let store = test_store();
        let printer = seed_printer(&store, "http://mock-h", true);
        let job = seed_job(
            &store,
            JobStatus::SCHEDULED | JobStatus::PRINTING,
            Some(printer.id),
        );

        let history = store.get_job_history(job.id).unwrap();
        let names: Vec<&str> = history.iter().map(|h| h.status.as_str()).collect();
        assert_eq!(names, vec!["Scheduled", "Printing"]);
    }

    #[test]
    fn test_update_job_appends_exactly_one_history_row() {
        let store = test_store();
        let mut job = seed_job(&store, JobStatus::CREATED, None);
        assert_eq!(store.get_job_history(job.id).unwrap().len(), 1);

        store.update_job(&mut job, Some(JobStatus::APPROVED)).unwrap();
        let history = store.get_job_history(job.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, "Approved");

        // No flag, no history row.
        store.update_job(&mut job, None).unwrap();
        assert_eq!(store.get_job_history(job.id).unwrap().len(), 2);
    }

    #[test]
    fn test_status_update_is_monotonic() {
        let store = test_store();
        let mut job = seed_job(&store, JobStatus::TO_SCHEDULE, None);
        store.update_job(&mut job, Some(JobStatus::SCHEDULED)).unwrap();

        let reloaded = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::TO_PRINT);
        assert!(reloaded.status.contains(JobStatus::CREATED));
    }

    #[test]
    fn test_unscheduled_jobs_fifo_order() {
        let store = test_store();
        let printer = seed_printer(&store, "http://mock-f", true);
        let j1 = seed_job(&store, JobStatus::TO_SCHEDULE, None);
        let j2 = seed_job(&store, JobStatus::TO_SCHEDULE, None);
        // Not approved: must not appear.
        seed_job(&store, JobStatus::CREATED, None);
        // Already assigned: must not appear.
        seed_job(&store, JobStatus::TO_SCHEDULE, Some(printer.id));

        let jobs = store.unscheduled_jobs().unwrap();
        let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![j1.id, j2.id]);
    }

    #[test]
    fn test_scheduled_jobs_requires_printer() {
        let store = test_store();
        let p1 = seed_printer(&store, "http://mock-s1", true);
        let p2 = seed_printer(&store, "http://mock-s2", true);
        seed_job(&store, JobStatus::TO_PRINT, None);
        let scheduled = seed_job(&store, JobStatus::TO_PRINT, Some(p1.id));
        seed_job(&store, JobStatus::TO_PRINT | JobStatus::PRINTING, Some(p2.id));

        let jobs = store.scheduled_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, scheduled.id);
    }

    #[test]
    fn test_current_printer_job_excludes_picked() {
        let store = test_store();
        let printer = seed_printer(&store, "http://mock-1", true);

        let mut done = seed_job(
            &store,
            JobStatus::TO_PRINT | JobStatus::PRINTING | JobStatus::PRINTED,
            Some(printer.id),
        );
        store.update_job(&mut done, Some(JobStatus::PICKED)).unwrap();

        assert!(store.current_printer_job(printer.id).unwrap().is_none());

        let live = seed_job(
            &store,
            JobStatus::TO_PRINT | JobStatus::PRINTING,
            Some(printer.id),
        );
        let current = store.current_printer_job(printer.id).unwrap().unwrap();
        assert_eq!(current.id, live.id);
    }

    #[test]
    fn test_current_printer_job_pending_counts_as_current() {
        let store = test_store();
        let printer = seed_printer(&store, "http://mock-2", true);
        let pending = seed_job(&store, JobStatus::TO_PRINT, Some(printer.id));

        let current = store.current_printer_job(printer.id).unwrap().unwrap();
        assert_eq!(current.id, pending.id);
        assert!(current.is_pending());
    }

    #[test]
    fn test_current_printer_job_invariant_violation() {
        let store = test_store();
        let printer = seed_printer(&store, "http://mock-3", true);
        seed_job(&store, JobStatus::TO_PRINT | JobStatus::PRINTING, Some(printer.id));
        seed_job(&store, JobStatus::TO_PRINT | JobStatus::PRINTING, Some(printer.id));

        assert!(matches!(
            store.current_printer_job(printer.id),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn test_active_printers_filter() {
        let store = test_store();
        seed_printer(&store, "http://a", true);
        seed_printer(&store, "http://b", false);

        let active = store.active_printers().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].url, "http://a");
    }

    #[test]
    fn test_printers_group_filter() {
        let store = test_store();
        let mut p = NewPrinter {
            url: "http://g1".into(),
            api_key: None,
            api: PrinterApi::PrusaLink,
            group_name: Some("cell-1".into()),
            active: true,
            opcua_name: None,
            camera_url: None,
            model: None,
        };
        store.create_printer(p.clone()).unwrap();
        p.url = "http://g2".into();
        p.group_name = Some("cell-2".into());
        store.create_printer(p).unwrap();

        let cell1 = store.printers(Some("cell-1"), None).unwrap();
        assert_eq!(cell1.len(), 1);
        assert_eq!(cell1[0].url, "http://g1");
    }

    #[test]
    fn test_cancel_order_issues_cancel_on_jobs() {
        let store = test_store();
        store.create_user("auth0|1", "amy", "user").unwrap();
        let order = store.create_order("auth0|1", None).unwrap();

        let job = store
            .create_job(NewJob {
                order_id: Some(order.id),
                user_id: Some("auth0|1".into()),
                status: JobStatus::TO_PRINT | JobStatus::PRINTING,
                from_server: true,
                gcode_file_path: Some("/tmp/x.gcode".into()),
                ..NewJob::default()
            })
            .unwrap();

        store.cancel_order(order.id).unwrap();

        let order = store.get_order(order.id).unwrap().unwrap();
        assert!(order.cancelled);

        let job = store.get_job(job.id).unwrap().unwrap();
        assert!(job.need_cancel());
    }

    #[test]
    fn test_generate_gcode_filename_keeps_extension() {
        let name = Store::generate_gcode_filename("benchy.bgcode");
        assert!(name.starts_with("server-"));
        assert!(name.ends_with(".bgcode"));

        let other = Store::generate_gcode_filename("part.gcode");
        assert_ne!(name, other);
    }
}
