//! Process-wide wiring.
//!
//! Builds the shared resources in dependency order (settings → database →
//! twin → HTTP client → worker manager) and hands them to the API router
//! and background tasks. There are no global singletons; everything hangs
//! off one context constructed in `main`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use crate::config::Settings;
use crate::db;
use crate::scheduler::FifoScheduler;
use crate::store::Store;
use crate::task::PeriodicTask;
use crate::twin::TwinClient;
use crate::worker::manager::{WorkerManager, WorkerSettings};

/// Per-request HTTP timeout shared by all printer drivers.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub twin: Arc<TwinClient>,
    pub http: reqwest::Client,
    pub manager: Arc<WorkerManager>,
}

impl AppContext {
    pub fn initialize(settings: Settings) -> anyhow::Result<AppContext> {
        settings
            .ensure_upload_path()
            .with_context(|| format!("create upload dir {:?}", settings.upload_path))?;

        let db_state =
            db::init(&settings.database_url).map_err(|e| anyhow::anyhow!("database init: {e}"))?;
        db::log_summary(&db_state);
        let store = Arc::new(Store::new(db_state));

        let twin = Arc::new(TwinClient::connect(
            &settings.opcua_server_url,
            &settings.opcua_server_namespace,
            settings.twin_is_mock(),
        )?);

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;

        let manager = Arc::new(WorkerManager::new(
            Arc::clone(&store),
            Arc::clone(&twin),
            http.clone(),
            WorkerSettings::from(&settings),
        ));

        Ok(AppContext {
            settings: Arc::new(settings),
            store,
            twin,
            http,
            manager,
        })
    }

    /// Boot workers for active printers and start the scheduler loop.
    pub fn start_background(&self) -> PeriodicTask {
        let started = self.manager.start_all();
        info!(workers = started, "background tasks starting");

        let scheduler = FifoScheduler::new(Arc::clone(&self.store), self.settings.auto_schedule);
        PeriodicTask::start(
            scheduler,
            Duration::from_secs_f64(self.settings.order_fetcher_interval.max(0.1)),
        )
    }

    /// Orderly release: scheduler first, then all workers, so no new
    /// assignments land while workers drain.
    pub async fn shutdown(&self, scheduler: PeriodicTask) {
        scheduler.stop().await;
        self.manager.stop_all().await;
        info!("control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(upload: &std::path::Path) -> Settings {
        let mut settings = Settings::from_env();
        settings.database_url = ":memory:".into();
        settings.opcua_server_url = "opc.tcp://mock:4840".into();
        settings.upload_path = upload.to_path_buf();
        settings.mock_printer_interval = 0.0;
        settings
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::initialize(test_settings(dir.path())).unwrap();

        assert_eq!(ctx.manager.worker_count(), 0);
        let scheduler = ctx.start_background();
        ctx.shutdown(scheduler).await;
    }

    #[tokio::test]
    async fn test_initialize_rejects_non_mock_twin() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.opcua_server_url = "opc.tcp://plc1:4840".into();

        assert!(AppContext::initialize(settings).is_err());
    }
}
