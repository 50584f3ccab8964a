use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::hub::CommandHub;
use crate::core::store::{Store, TriggerRecord};
use crate::core::types::{CommandMessage, TriggerStatus};

/// Converts per-device trigger configuration into timed capture commands and
/// an auditable `scheduled_triggers` history.
///
/// The loop is a cancellable task rather than a free-running timer thread:
/// `run` exits on the shutdown token, and `tick` is a plain method so tests
/// drive time deterministically.
pub struct TriggerScheduler {
    store: Store,
    hub: CommandHub,
    tick_period: Duration,
    shutdown: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(
        store: Store,
        hub: CommandHub,
        tick_period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            hub,
            tick_period,
            shutdown,
        }
    }

    pub async fn run(&self) {
        info!(
            "Trigger scheduler running (tick every {:?})",
            self.tick_period
        );
        let mut interval = tokio::time::interval(self.tick_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Trigger scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// One scheduling pass. Per-device errors are absorbed so a single bad
    /// device cannot starve the rest of the fleet.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let devices = self.store.devices_with_trigger_enabled().await?;
        for device in devices {
            let due = self
                .store
                .create_trigger_if_due(&device.id, device.trigger_interval_seconds, now)
                .await;
            let trigger = match due {
                Ok(Some(trigger)) => trigger,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Due check failed for device [{}]: {}", device.id, e);
                    continue;
                }
            };

            if let Err(e) = self.dispatch(&trigger, now).await {
                warn!(
                    "Dispatch failed for trigger [{}] on device [{}]: {}",
                    trigger.id, device.id, e
                );
            }
        }
        Ok(())
    }

    /// Creates and immediately dispatches a manual trigger, bypassing the
    /// interval check. Returns the trigger id and its post-dispatch status
    /// (`sent` when a stream accepted the command, `pending` otherwise).
    pub async fn trigger_manual(&self, device_id: &str) -> Result<(String, TriggerStatus)> {
        let now = Utc::now();
        let trigger = self.store.create_manual_trigger(device_id, now).await?;
        let delivered = self.dispatch(&trigger, now).await?;
        let status = if delivered {
            TriggerStatus::Sent
        } else {
            TriggerStatus::Pending
        };
        Ok((trigger.id, status))
    }

    /// Marks the trigger a just-ingested capture fulfilled. With an explicit
    /// reference the named trigger moves sent -> executed, provided it
    /// belongs to the ingesting device; without one, the device's newest
    /// `sent` trigger is linked instead. Returns the executed trigger id,
    /// if any.
    pub async fn link_capture(
        &self,
        device_id: &str,
        trigger_id: Option<&str>,
        capture_id: &str,
    ) -> Result<Option<String>> {
        let now = Utc::now();
        match trigger_id {
            Some(id) => {
                let marked = self
                    .store
                    .mark_trigger_executed(id, device_id, capture_id, now)
                    .await?;
                if !marked {
                    debug!(
                        "Capture [{}] referenced trigger [{}] not in sent state for its device",
                        capture_id, id
                    );
                }
                Ok(marked.then(|| id.to_string()))
            }
            None => {
                self.store
                    .mark_latest_sent_executed(device_id, capture_id, now)
                    .await
            }
        }
    }

    /// Publishes the capture command and, only when a live stream accepted
    /// it, advances the row to `sent`. An undelivered trigger stays
    /// `pending`: there is no retry within the tick, and the next due check
    /// keys off `scheduled_at`, so the row blocks at most one interval.
    async fn dispatch(&self, trigger: &TriggerRecord, now: DateTime<Utc>) -> Result<bool> {
        let message = CommandMessage::capture(Some(trigger.id.clone()));
        let delivered = self.hub.publish(&trigger.device_id, message);
        if delivered {
            self.store.mark_trigger_sent(&trigger.id, now).await?;
            debug!(
                "Trigger [{}] sent to device [{}]",
                trigger.id, trigger.device_id
            );
        } else {
            debug!(
                "Device [{}] not connected, trigger [{}] stays pending",
                trigger.device_id, trigger.id
            );
        }
        Ok(delivered)
    }
}
