use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params, types::Type};
use serde::Serialize;
use uuid::Uuid;

use super::{Store, parse_ts_opt, to_ts};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub trigger_enabled: bool,
    pub trigger_interval_seconds: i64,
    pub guidance: String,
    pub activated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const DEVICE_COLS: &str = "id, org_id, name, trigger_enabled, trigger_interval_seconds, \
                           guidance, activated_at, last_notified_at, created_at";

pub(super) fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(super) fn ts_col_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn device_from_row(row: &Row) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        trigger_enabled: row.get::<_, i64>(3)? != 0,
        trigger_interval_seconds: row.get(4)?,
        guidance: row.get(5)?,
        activated_at: ts_col(row, 6)?,
        last_notified_at: ts_col_opt(row, 7)?,
        created_at: ts_col(row, 8)?,
    })
}

impl Store {
    pub async fn create_device(&self, org_id: &str, name: &str, guidance: &str) -> Result<DeviceRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO devices (id, org_id, name, trigger_enabled, trigger_interval_seconds,
                                  guidance, activated_at, created_at)
             VALUES (?1, ?2, ?3, 0, 300, ?4, ?5, ?5)",
            params![id, org_id, name, guidance, to_ts(now)],
        )?;
        Ok(DeviceRecord {
            id,
            org_id: org_id.to_string(),
            name: name.to_string(),
            trigger_enabled: false,
            trigger_interval_seconds: 300,
            guidance: guidance.to_string(),
            activated_at: now,
            last_notified_at: None,
            created_at: now,
        })
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let db = self.db().lock().await;
        let device = db
            .query_row(
                &format!("SELECT {DEVICE_COLS} FROM devices WHERE id = ?1"),
                params![device_id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let db = self.db().lock().await;
        let mut stmt =
            db.prepare(&format!("SELECT {DEVICE_COLS} FROM devices ORDER BY created_at"))?;
        let rows = stmt.query_map([], device_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn devices_with_trigger_enabled(&self) -> Result<Vec<DeviceRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE trigger_enabled = 1"
        ))?;
        let rows = stmt.query_map([], device_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Returns false when the device does not exist.
    pub async fn set_trigger_config(
        &self,
        device_id: &str,
        enabled: bool,
        interval_seconds: i64,
    ) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE devices SET trigger_enabled = ?2, trigger_interval_seconds = ?3
             WHERE id = ?1",
            params![device_id, enabled as i64, interval_seconds],
        )?;
        Ok(changed > 0)
    }

    /// Claims the right to notify for this device: succeeds only when no
    /// notification was recorded within `cooldown`, and records `now` as the
    /// new last-notified timestamp in the same locked scope. At most one of
    /// several concurrent claimants wins a given cooldown window.
    pub async fn claim_notification_slot(
        &self,
        device_id: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db().lock().await;
        let last: Option<Option<String>> = db
            .query_row(
                "SELECT last_notified_at FROM devices WHERE id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last) = last else {
            return Ok(false); // unknown device
        };
        if let Some(last) = parse_ts_opt(last)?
            && now - last < cooldown
        {
            return Ok(false);
        }

        db.execute(
            "UPDATE devices SET last_notified_at = ?2 WHERE id = ?1",
            params![device_id, to_ts(now)],
        )?;
        Ok(true)
    }
}
