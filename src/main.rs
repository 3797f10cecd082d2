//! Control-plane server binary: configuration, logging, background tasks,
//! and the HTTP API, with graceful shutdown on SIGINT.

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use printfarm::api;
use printfarm::config::Settings;
use printfarm::context::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    let _log_guard = init_tracing(&settings);

    let ctx = AppContext::initialize(settings)?;
    let scheduler = ctx.start_background();

    let listener = tokio::net::TcpListener::bind(&ctx.settings.http_bind).await?;
    info!(addr = %ctx.settings.http_bind, "control plane listening");

    axum::serve(listener, api::router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.shutdown(scheduler).await;
    Ok(())
}

/// `RUST_LOG` wins over `LOGGING_LEVEL`; logs go to stderr and, when
/// `LOG_PATH` is set, to a daily-rotated file. The returned guard must live
/// for the whole process so buffered file writes flush.
fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.tracing_directive()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match &settings.log_path {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "printfarm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
