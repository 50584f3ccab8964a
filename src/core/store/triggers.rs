use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use uuid::Uuid;

use super::devices::{ts_col, ts_col_opt};
use super::{Store, to_ts};
use crate::core::types::{TriggerStatus, TriggerType};

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRecord {
    pub id: String,
    pub device_id: String,
    pub trigger_type: TriggerType,
    pub status: TriggerStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
}

const TRIGGER_COLS: &str =
    "id, device_id, trigger_type, status, scheduled_at, sent_at, executed_at, capture_id";

fn trigger_from_row(row: &Row) -> rusqlite::Result<TriggerRecord> {
    let type_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    Ok(TriggerRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        trigger_type: TriggerType::parse(&type_raw).unwrap_or(TriggerType::Scheduled),
        status: TriggerStatus::parse(&status_raw).unwrap_or(TriggerStatus::Failed),
        scheduled_at: ts_col(row, 4)?,
        sent_at: ts_col_opt(row, 5)?,
        executed_at: ts_col_opt(row, 6)?,
        capture_id: row.get(7)?,
    })
}

impl Store {
    /// The scheduler's per-device idempotency guard: reads the newest
    /// scheduled trigger's `scheduled_at` (falling back to the device's
    /// activation time) and inserts a new pending row only when
    /// `interval_seconds` have elapsed, all under one connection lock.
    /// Overlapping ticks serialize here, so at most one row exists per
    /// interval window.
    pub async fn create_trigger_if_due(
        &self,
        device_id: &str,
        interval_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerRecord>> {
        let db = self.db().lock().await;

        let last_scheduled: Option<String> = db
            .query_row(
                "SELECT scheduled_at FROM scheduled_triggers
                 WHERE device_id = ?1 AND trigger_type = 'scheduled'
                 ORDER BY scheduled_at DESC LIMIT 1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;

        let since = match last_scheduled {
            Some(raw) => super::parse_ts(&raw)?,
            None => {
                let activated: Option<String> = db
                    .query_row(
                        "SELECT activated_at FROM devices WHERE id = ?1",
                        params![device_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match activated {
                    Some(raw) => super::parse_ts(&raw)?,
                    None => return Ok(None), // device vanished mid-tick
                }
            }
        };

        if now - since < Duration::seconds(interval_seconds) {
            return Ok(None);
        }

        let trigger = TriggerRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            trigger_type: TriggerType::Scheduled,
            status: TriggerStatus::Pending,
            scheduled_at: now,
            sent_at: None,
            executed_at: None,
            capture_id: None,
        };
        db.execute(
            "INSERT INTO scheduled_triggers (id, device_id, trigger_type, status, scheduled_at)
             VALUES (?1, ?2, 'scheduled', 'pending', ?3)",
            params![trigger.id, trigger.device_id, to_ts(now)],
        )?;
        Ok(Some(trigger))
    }

    /// Manual triggers bypass the interval check entirely.
    pub async fn create_manual_trigger(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TriggerRecord> {
        let trigger = TriggerRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            trigger_type: TriggerType::Manual,
            status: TriggerStatus::Pending,
            scheduled_at: now,
            sent_at: None,
            executed_at: None,
            capture_id: None,
        };
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO scheduled_triggers (id, device_id, trigger_type, status, scheduled_at)
             VALUES (?1, ?2, 'manual', 'pending', ?3)",
            params![trigger.id, trigger.device_id, to_ts(now)],
        )?;
        Ok(trigger)
    }

    /// pending -> sent. Returns false if the row was not pending (a status
    /// never regresses, so a late caller simply loses).
    pub async fn mark_trigger_sent(&self, trigger_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE scheduled_triggers SET status = 'sent', sent_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![trigger_id, to_ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// sent -> executed, linking the capture that fulfilled the trigger.
    /// Scoped to the capture's device: a trigger id belonging to another
    /// device does not match, so one device's capture can never consume
    /// another device's trigger.
    pub async fn mark_trigger_executed(
        &self,
        trigger_id: &str,
        device_id: &str,
        capture_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE scheduled_triggers SET status = 'executed', executed_at = ?2, capture_id = ?3
             WHERE id = ?1 AND device_id = ?4 AND status = 'sent'",
            params![trigger_id, to_ts(now), capture_id, device_id],
        )?;
        Ok(changed > 0)
    }

    /// For captures that arrive without an explicit trigger reference: link
    /// the device's newest `sent` trigger instead. Returns the trigger id
    /// that was marked, if any.
    pub async fn mark_latest_sent_executed(
        &self,
        device_id: &str,
        capture_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let db = self.db().lock().await;
        let latest: Option<String> = db
            .query_row(
                "SELECT id FROM scheduled_triggers
                 WHERE device_id = ?1 AND status = 'sent'
                 ORDER BY sent_at DESC LIMIT 1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(trigger_id) = latest else {
            return Ok(None);
        };
        let changed = db.execute(
            "UPDATE scheduled_triggers SET status = 'executed', executed_at = ?2, capture_id = ?3
             WHERE id = ?1 AND status = 'sent'",
            params![trigger_id, to_ts(now), capture_id],
        )?;
        Ok((changed > 0).then_some(trigger_id))
    }

    /// Operator transition for triggers that will never complete.
    pub async fn mark_trigger_failed(&self, trigger_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE scheduled_triggers SET status = 'failed'
             WHERE id = ?1 AND status IN ('pending', 'sent')",
            params![trigger_id],
        )?;
        Ok(changed > 0)
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerRecord>> {
        let db = self.db().lock().await;
        let trigger = db
            .query_row(
                &format!("SELECT {TRIGGER_COLS} FROM scheduled_triggers WHERE id = ?1"),
                params![trigger_id],
                trigger_from_row,
            )
            .optional()?;
        Ok(trigger)
    }

    pub async fn list_triggers_for_device(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TriggerRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TRIGGER_COLS} FROM scheduled_triggers
             WHERE device_id = ?1 ORDER BY scheduled_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![device_id, limit as i64], trigger_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn device(store: &Store) -> String {
        store
            .create_device("org-1", "cam-a", "")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn due_check_waits_out_the_interval() {
        let store = Store::open_ephemeral().unwrap();
        let device_id = device(&store).await;
        let t0 = Utc::now();

        // Not yet due right after activation.
        assert!(
            store
                .create_trigger_if_due(&device_id, 10, t0 + Duration::seconds(5))
                .await
                .unwrap()
                .is_none()
        );
        // Due once the interval has elapsed.
        let first = store
            .create_trigger_if_due(&device_id, 10, t0 + Duration::seconds(10))
            .await
            .unwrap()
            .expect("trigger due");
        assert_eq!(first.status, TriggerStatus::Pending);

        // The fresh pending row blocks re-fire within its own interval.
        assert!(
            store
                .create_trigger_if_due(&device_id, 10, t0 + Duration::seconds(15))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .create_trigger_if_due(&device_id, 10, t0 + Duration::seconds(20))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn concurrent_due_checks_create_one_row() {
        let store = Store::open_ephemeral().unwrap();
        let device_id = device(&store).await;
        let now = Utc::now() + Duration::seconds(30);

        let (a, b) = tokio::join!(
            store.create_trigger_if_due(&device_id, 10, now),
            store.create_trigger_if_due(&device_id, 10, now),
        );
        let created = [a.unwrap(), b.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(created, 1, "overlapping ticks must not double-schedule");
    }

    #[tokio::test]
    async fn status_never_regresses() {
        let store = Store::open_ephemeral().unwrap();
        let device_id = device(&store).await;
        let now = Utc::now();
        let trigger = store.create_manual_trigger(&device_id, now).await.unwrap();

        assert!(store.mark_trigger_sent(&trigger.id, now).await.unwrap());
        // A second sent attempt loses: the row is no longer pending.
        assert!(!store.mark_trigger_sent(&trigger.id, now).await.unwrap());

        assert!(
            store
                .mark_trigger_executed(&trigger.id, &device_id, "cap-1", now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .mark_trigger_executed(&trigger.id, &device_id, "cap-2", now)
                .await
                .unwrap()
        );
        // Executed is terminal; failure cannot overwrite it.
        assert!(!store.mark_trigger_failed(&trigger.id).await.unwrap());

        let row = store.get_trigger(&trigger.id).await.unwrap().unwrap();
        assert_eq!(row.status, TriggerStatus::Executed);
        assert_eq!(row.capture_id.as_deref(), Some("cap-1"));
    }

    #[tokio::test]
    async fn capture_from_another_device_cannot_execute_the_trigger() {
        let store = Store::open_ephemeral().unwrap();
        let device_a = device(&store).await;
        let device_b = store
            .create_device("org-1", "cam-b", "")
            .await
            .unwrap()
            .id;
        let now = Utc::now();
        let trigger = store.create_manual_trigger(&device_b, now).await.unwrap();
        store.mark_trigger_sent(&trigger.id, now).await.unwrap();

        // Device A referencing device B's trigger id must not match.
        assert!(
            !store
                .mark_trigger_executed(&trigger.id, &device_a, "cap-from-a", now)
                .await
                .unwrap()
        );
        let row = store.get_trigger(&trigger.id).await.unwrap().unwrap();
        assert_eq!(row.status, TriggerStatus::Sent);
        assert!(row.capture_id.is_none());

        // The owning device still links normally.
        assert!(
            store
                .mark_trigger_executed(&trigger.id, &device_b, "cap-from-b", now)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn latest_sent_trigger_is_linked_when_capture_has_no_reference() {
        let store = Store::open_ephemeral().unwrap();
        let device_id = device(&store).await;
        let t0 = Utc::now();

        let older = store.create_manual_trigger(&device_id, t0).await.unwrap();
        let newer = store.create_manual_trigger(&device_id, t0).await.unwrap();
        store.mark_trigger_sent(&older.id, t0).await.unwrap();
        store
            .mark_trigger_sent(&newer.id, t0 + Duration::seconds(5))
            .await
            .unwrap();

        let linked = store
            .mark_latest_sent_executed(&device_id, "cap-9", t0 + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(linked.as_deref(), Some(newer.id.as_str()));

        let older_row = store.get_trigger(&older.id).await.unwrap().unwrap();
        assert_eq!(older_row.status, TriggerStatus::Sent);
    }

    #[tokio::test]
    async fn no_sent_trigger_means_no_link() {
        let store = Store::open_ephemeral().unwrap();
        let device_id = device(&store).await;
        let linked = store
            .mark_latest_sent_executed(&device_id, "cap-1", Utc::now())
            .await
            .unwrap();
        assert!(linked.is_none());
    }
}
