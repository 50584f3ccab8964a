use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::types::{CaptureEvent, CommandMessage};

/// Ring-buffer capacity of a device command channel. A slow consumer lags and
/// loses the oldest commands first (drop-oldest overflow policy).
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Capacity of a per-org capture event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

struct DeviceChannel {
    tx: broadcast::Sender<CommandMessage>,
    subscription_id: Uuid,
}

#[derive(Default)]
struct CommandHubInner {
    channels: Mutex<HashMap<String, DeviceChannel>>,
    dropped: AtomicU64,
}

/// Per-device command pub/sub. At most one consumer per device key is
/// meaningful: a new `subscribe` for the same key supersedes the previous
/// subscription (its stream ends) rather than fanning out in parallel.
///
/// Delivery is at-most-once and in-memory only. `publish` to a key with no
/// live consumer drops the message and reports `false`; nothing is retried or
/// replayed after reconnect.
#[derive(Clone, Default)]
pub struct CommandHub {
    inner: Arc<CommandHubInner>,
}

/// Handle returned by [`CommandHub::subscribe`]. Dropping it (or the stream
/// built from its receiver half) unsubscribes, unless a newer subscription
/// has already taken over the key.
pub struct CommandSubscription {
    pub guard: SubscriptionGuard,
    pub receiver: broadcast::Receiver<CommandMessage>,
}

pub struct SubscriptionGuard {
    hub: CommandHub,
    device_id: String,
    id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.remove_if_current(&self.device_id, self.id);
    }
}

impl CommandHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the canonical command channel for `device_id`. Any previous
    /// subscription for the key is superseded: its sender is dropped, so the
    /// old consumer's receive loop terminates with a closed-channel error.
    pub fn subscribe(&self, device_id: &str) -> CommandSubscription {
        let (tx, rx) = broadcast::channel(COMMAND_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();

        let mut channels = self.inner.channels.lock().unwrap();
        if channels
            .insert(
                device_id.to_string(),
                DeviceChannel {
                    tx,
                    subscription_id: id,
                },
            )
            .is_some()
        {
            debug!("Device [{}] resubscribed, superseding previous stream", device_id);
        }

        CommandSubscription {
            guard: SubscriptionGuard {
                hub: self.clone(),
                device_id: device_id.to_string(),
                id,
            },
            receiver: rx,
        }
    }

    /// Hands `message` to the device's open channel. Returns whether a live
    /// consumer existed at publish time; never errors. Receipt by the device
    /// is not acknowledged at this layer.
    pub fn publish(&self, device_id: &str, message: CommandMessage) -> bool {
        let mut channels = self.inner.channels.lock().unwrap();
        let Some(channel) = channels.get(device_id) else {
            debug!("No open command stream for device [{}], dropping command", device_id);
            return false;
        };
        match channel.tx.send(message) {
            Ok(_) => true,
            Err(_) => {
                // Receiver was dropped without cleanup (e.g. task aborted).
                channels.remove(device_id);
                debug!("Pruned dead command channel for device [{}]", device_id);
                false
            }
        }
    }

    /// Presence snapshot: device ids with a currently-open command stream.
    pub fn list_active_keys(&self) -> Vec<String> {
        let channels = self.inner.channels.lock().unwrap();
        channels.keys().cloned().collect()
    }

    /// Called by a consumer that observed `Lagged(n)`: the ring buffer
    /// overwrote its oldest undelivered commands.
    pub fn note_dropped(&self, n: u64) {
        let total = self.inner.dropped.fetch_add(n, Ordering::Relaxed) + n;
        warn!("Command channel overflow: dropped {} (total {})", n, total);
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn remove_if_current(&self, device_id: &str, id: Uuid) {
        let mut channels = self.inner.channels.lock().unwrap();
        if channels
            .get(device_id)
            .is_some_and(|c| c.subscription_id == id)
        {
            channels.remove(device_id);
        }
        // A mismatched id means this guard was superseded; nothing to do.
    }
}

/// Per-org capture event fan-out: the structural twin of [`CommandHub`] with
/// the single-consumer restriction lifted. Every subscriber for an org
/// receives a copy of every publish in that org; device-level filtering is a
/// consumer-side view, so an unfiltered subscription is the wildcard key.
#[derive(Clone, Default)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<CaptureEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, org_id: &str) -> broadcast::Receiver<CaptureEvent> {
        let mut channels = self.channels.lock().unwrap();
        // Orgs whose dashboards all disconnected without a later publish
        // would otherwise keep a dead sender entry forever.
        channels.retain(|_, tx| tx.receiver_count() > 0);
        channels
            .entry(org_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, org_id: &str, event: CaptureEvent) -> bool {
        let mut channels = self.channels.lock().unwrap();
        let Some(tx) = channels.get(org_id) else {
            return false;
        };
        match tx.send(event) {
            Ok(_) => true,
            Err(_) => {
                // Last dashboard for this org disconnected; prune lazily.
                channels.remove(org_id);
                false
            }
        }
    }
}
