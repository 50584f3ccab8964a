use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use uuid::Uuid;

use super::devices::ts_col;
use super::{Store, to_ts};
use crate::core::types::{CaptureState, EvaluationStatus};

#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub artifact_ref: String,
    pub evaluation_status: EvaluationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CaptureState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

const CAPTURE_COLS: &str = "id, device_id, trigger_id, artifact_ref, evaluation_status, \
                            state, score, reason, agent_details, created_at";

fn capture_from_row(row: &Row) -> rusqlite::Result<CaptureRecord> {
    let status_raw: String = row.get(4)?;
    let state_raw: Option<String> = row.get(5)?;
    let details_raw: Option<String> = row.get(8)?;
    Ok(CaptureRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        trigger_id: row.get(2)?,
        artifact_ref: row.get(3)?,
        evaluation_status: EvaluationStatus::parse(&status_raw)
            .unwrap_or(EvaluationStatus::Failed),
        state: state_raw.as_deref().and_then(CaptureState::parse),
        score: row.get(6)?,
        reason: row.get(7)?,
        agent_details: details_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: ts_col(row, 9)?,
    })
}

impl Store {
    /// Ingestion entry point: the row starts `pending` and the caller returns
    /// to the device immediately. Classification happens later.
    pub async fn create_capture(
        &self,
        device_id: &str,
        trigger_id: Option<&str>,
        artifact_ref: &str,
    ) -> Result<CaptureRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let db = self.db().lock().await;
        db.execute(
            "INSERT INTO captures (id, device_id, trigger_id, artifact_ref, evaluation_status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![id, device_id, trigger_id, artifact_ref, to_ts(now)],
        )?;
        Ok(CaptureRecord {
            id,
            device_id: device_id.to_string(),
            trigger_id: trigger_id.map(str::to_string),
            artifact_ref: artifact_ref.to_string(),
            evaluation_status: EvaluationStatus::Pending,
            state: None,
            score: None,
            reason: None,
            agent_details: None,
            created_at: now,
        })
    }

    pub async fn get_capture(&self, capture_id: &str) -> Result<Option<CaptureRecord>> {
        let db = self.db().lock().await;
        let capture = db
            .query_row(
                &format!("SELECT {CAPTURE_COLS} FROM captures WHERE id = ?1"),
                params![capture_id],
                capture_from_row,
            )
            .optional()?;
        Ok(capture)
    }

    /// pending -> processing. The evaluator's single-flight guard: exactly one
    /// of any number of concurrent claimants sees true.
    pub async fn claim_capture_for_evaluation(&self, capture_id: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE captures SET evaluation_status = 'processing'
             WHERE id = ?1 AND evaluation_status = 'pending'",
            params![capture_id],
        )?;
        Ok(changed > 0)
    }

    /// processing -> completed, persisting the consensus result atomically
    /// with the claim release.
    pub async fn complete_evaluation(
        &self,
        capture_id: &str,
        state: CaptureState,
        score: f64,
        reason: &str,
        agent_details: &serde_json::Value,
    ) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE captures
             SET evaluation_status = 'completed', state = ?2, score = ?3, reason = ?4, agent_details = ?5
             WHERE id = ?1 AND evaluation_status = 'processing'",
            params![
                capture_id,
                state.as_str(),
                score,
                reason,
                agent_details.to_string()
            ],
        )?;
        Ok(changed > 0)
    }

    /// processing -> failed. Keeps the failure reason for operators; a capture
    /// is never left stuck in `processing`.
    pub async fn fail_evaluation(&self, capture_id: &str, reason: &str) -> Result<bool> {
        let db = self.db().lock().await;
        let changed = db.execute(
            "UPDATE captures SET evaluation_status = 'failed', reason = ?2
             WHERE id = ?1 AND evaluation_status = 'processing'",
            params![capture_id, reason],
        )?;
        Ok(changed > 0)
    }

    pub async fn list_captures_for_device(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<CaptureRecord>> {
        let db = self.db().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {CAPTURE_COLS} FROM captures
             WHERE device_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![device_id, limit as i64], capture_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
