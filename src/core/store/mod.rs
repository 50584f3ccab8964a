mod captures;
mod devices;
mod triggers;

pub use captures::CaptureRecord;
pub use devices::DeviceRecord;
pub use triggers::TriggerRecord;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

/// Record store for devices, scheduled triggers and captures.
///
/// All status transitions go through guarded UPDATEs
/// (`... WHERE status = <expected>`), so a status can only move forward and
/// concurrent writers cannot double-claim a row.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }

        let db = Connection::open(db_path)?;
        Self::create_schema(&db)?;
        info!("Record store ready at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store for tests.
    pub fn open_ephemeral() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::create_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn create_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                trigger_enabled INTEGER NOT NULL DEFAULT 0,
                trigger_interval_seconds INTEGER NOT NULL DEFAULT 300,
                guidance TEXT NOT NULL DEFAULT '',
                activated_at TEXT NOT NULL,
                last_notified_at TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS scheduled_triggers (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                sent_at TEXT,
                executed_at TEXT,
                capture_id TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_triggers_device_time
             ON scheduled_triggers (device_id, scheduled_at DESC)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS captures (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                trigger_id TEXT,
                artifact_ref TEXT NOT NULL,
                evaluation_status TEXT NOT NULL,
                state TEXT,
                score REAL,
                reason TEXT,
                agent_details TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

pub(crate) fn to_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}
