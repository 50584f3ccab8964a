mod config;
mod core;
mod interfaces;
mod logging;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::agents::build_agent;
use crate::core::evaluator::ConsensusEvaluator;
use crate::core::hub::{CommandHub, EventHub};
use crate::core::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::core::scheduler::TriggerScheduler;
use crate::core::store::Store;
use crate::interfaces::web::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("watchpost: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let log_tx = logging::init();
    info!("Starting watchpost");

    let store = Store::open(&config.db_path).await?;
    let command_hub = CommandHub::new();
    let event_hub = EventHub::new();

    let agent_a = build_agent(&config.agents.primary)?;
    let agent_b = build_agent(&config.agents.secondary)?;
    info!(
        "Classification agents: {} + {}",
        agent_a.name(),
        agent_b.name()
    );

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => {
            warn!("No notification webhook configured, alerts go to the log");
            Arc::new(LogNotifier)
        }
    };

    let evaluator = Arc::new(ConsensusEvaluator::new(
        store.clone(),
        event_hub.clone(),
        agent_a,
        agent_b,
        notifier,
        Duration::from_secs(config.agent_timeout_seconds),
        chrono::Duration::seconds(config.notification_cooldown_seconds),
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(TriggerScheduler::new(
        store.clone(),
        command_hub.clone(),
        Duration::from_secs(config.scheduler_tick_seconds),
        shutdown.clone(),
    ));
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let state = AppState {
        store,
        command_hub,
        event_hub,
        scheduler,
        evaluator,
        log_tx,
        command_keepalive: Duration::from_secs(config.command_keepalive_seconds),
        event_keepalive: Duration::from_secs(config.event_keepalive_seconds),
    };

    let addr = format!("{}:{}", config.api_host, config.api_port);
    interfaces::web::serve(state, &addr).await?;

    shutdown.cancel();
    let _ = scheduler_task.await;
    info!("Watchpost stopped");
    Ok(())
}
