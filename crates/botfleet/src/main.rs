use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use botfleet_core::{
    config::Config,
    fleet::FleetManager,
    session::{SessionDeps, SessionHandle, SessionSettings},
    store::{FileContextStore, JsonConfigStore},
};
use botfleet_openai::OpenAiClient;
use botfleet_telegram::TelegramTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    botfleet_core::logging::init("botfleet")?;

    let cfg = Config::load()?;
    info!(
        bots_file = %cfg.bots_file.display(),
        context_dir = %cfg.context_dir.display(),
        model = %cfg.openai_model,
        "botfleet starting"
    );

    let completion = OpenAiClient::new(
        cfg.openai_api_key.clone(),
        cfg.openai_base_url.clone(),
        cfg.openai_model.clone(),
        cfg.completion_timeout,
    )
    .context("building completion client")?;

    let deps = SessionDeps {
        config_store: Arc::new(JsonConfigStore::new(cfg.bots_file.clone())),
        context_store: Arc::new(FileContextStore::new(cfg.context_dir.clone())),
        completion: Arc::new(completion),
        transport: Arc::new(TelegramTransport::new(cfg.telegram_poll_timeout)),
    };
    let fleet = FleetManager::new(deps, SessionSettings::from_config(&cfg));

    let running = fleet.start().await.context("initial fleet start")?;
    log_status(&fleet.status().await);
    info!(running, "fleet started");

    if let Some(interval) = cfg.reload_interval {
        fleet.ensure_watcher(interval).await;
    }

    wait_for_shutdown(&fleet).await?;

    let stopped = fleet.shutdown().await;
    info!(count = stopped.len(), "fleet stopped");
    Ok(())
}

fn log_status(handles: &[SessionHandle]) {
    for h in handles {
        match &h.last_error {
            Some(err) => warn!(
                bot_id = %h.bot_id,
                state = ?h.state,
                auth_failed = h.auth_failed,
                error = %err,
                "bot not running"
            ),
            None => info!(bot_id = %h.bot_id, state = ?h.state, "bot session"),
        }
    }
}

async fn reload(fleet: &FleetManager) {
    match fleet.reload().await {
        Ok(summary) => {
            info!(?summary, "reload finished");
            log_status(&fleet.status().await);
        }
        Err(e) => warn!(error = %e, "reload failed; running sessions untouched"),
    }
}

/// Blocks until Ctrl-C or SIGTERM. SIGHUP triggers a reload.
#[cfg(unix)]
async fn wait_for_shutdown(fleet: &FleetManager) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                return Ok(());
            }
            _ = term.recv() => {
                info!("SIGTERM received");
                return Ok(());
            }
            _ = hup.recv() => {
                info!("SIGHUP received; reloading bot records");
                reload(fleet).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_fleet: &FleetManager) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("interrupt received");
    Ok(())
}
