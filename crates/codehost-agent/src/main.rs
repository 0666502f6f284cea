use std::sync::Arc;

use anyhow::Context;
use codehost_agent::{CodeHostService, DirectoryScaffolder, Registry, Settings};
use futures_util::future::join_all;

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let log_dir = std::env::var("CODEHOST_LOG_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "codehost-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let settings = Settings::from_env();
    tracing::info!(
        data_root = %settings.data_root().display(),
        base_port = settings.base_port,
        bin = %settings.server_bin,
        "codehost-agent starting"
    );
    let registry = Arc::new(Registry::new(settings));
    let service = CodeHostService::new(registry, Arc::new(DirectoryScaffolder));

    let keys: Vec<String> = std::env::args().skip(1).collect();
    let started = join_all(keys.iter().map(|key| service.start(key))).await;
    for (key, resp) in keys.iter().zip(started) {
        let line = serde_json::json!({ "key": key, "start": resp });
        println!("{}", serde_json::to_string(&line).context("encode start response")?);
    }

    shutdown_signal().await?;
    tracing::info!("shutdown requested; stopping all workspaces");
    service.shutdown_all().await;
    Ok(())
}
