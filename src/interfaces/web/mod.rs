mod handlers;
mod router;

pub use router::build_api_router;

use anyhow::Result;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::core::evaluator::ConsensusEvaluator;
use crate::core::hub::{CommandHub, EventHub};
use crate::core::scheduler::TriggerScheduler;
use crate::core::store::Store;

/// Shared handles injected into every request handler. All hub and store
/// state is owned here, never global.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub command_hub: CommandHub,
    pub event_hub: EventHub,
    pub scheduler: Arc<TriggerScheduler>,
    pub evaluator: Arc<ConsensusEvaluator>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub command_keepalive: Duration,
    pub event_keepalive: Duration,
}

/// Binds and serves the API until the process is told to stop.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = build_api_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Watchpost API running at http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

// --- SSE log feed (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
