use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a scheduling decision. Forward-only:
/// pending -> sent -> executed, or any non-terminal state -> failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Pending,
    Sent,
    Executed,
    Failed,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Pending => "pending",
            TriggerStatus::Sent => "sent",
            TriggerStatus::Executed => "executed",
            TriggerStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TriggerStatus::Pending),
            "sent" => Some(TriggerStatus::Sent),
            "executed" => Some(TriggerStatus::Executed),
            "failed" => Some(TriggerStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            _ => None,
        }
    }
}

/// Evaluation lifecycle of a capture. Forward-only:
/// pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Processing => "processing",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EvaluationStatus::Pending),
            "processing" => Some(EvaluationStatus::Processing),
            "completed" => Some(EvaluationStatus::Completed),
            "failed" => Some(EvaluationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Normal,
    Abnormal,
    Uncertain,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Normal => "normal",
            CaptureState::Abnormal => "abnormal",
            CaptureState::Uncertain => "uncertain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(CaptureState::Normal),
            "abnormal" => Some(CaptureState::Abnormal),
            "uncertain" => Some(CaptureState::Uncertain),
            _ => None,
        }
    }
}

/// A command pushed to a device over its open stream. Ephemeral: lives only
/// inside the hub's channel, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

impl CommandMessage {
    pub fn capture(trigger_id: Option<String>) -> Self {
        Self {
            command: "capture".to_string(),
            trigger_id,
            params: serde_json::Value::Null,
            issued_at: Utc::now(),
        }
    }
}

/// A capture lifecycle event re-broadcast to dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureEvent {
    pub event: String,
    pub org_id: String,
    pub device_id: String,
    pub capture_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CaptureState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub occurred_at: DateTime<Utc>,
}

impl CaptureEvent {
    pub fn new(event: &str, org_id: &str, device_id: &str, capture_id: &str) -> Self {
        Self {
            event: event.to_string(),
            org_id: org_id.to_string(),
            device_id: device_id.to_string(),
            capture_id: capture_id.to_string(),
            state: None,
            score: None,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for s in [
            TriggerStatus::Pending,
            TriggerStatus::Sent,
            TriggerStatus::Executed,
            TriggerStatus::Failed,
        ] {
            assert_eq!(TriggerStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            EvaluationStatus::Pending,
            EvaluationStatus::Processing,
            EvaluationStatus::Completed,
            EvaluationStatus::Failed,
        ] {
            assert_eq!(EvaluationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TriggerStatus::parse("bogus"), None);
    }

    #[test]
    fn command_message_serializes_compactly() {
        let msg = CommandMessage::capture(Some("t-1".to_string()));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"], "capture");
        assert_eq!(json["trigger_id"], "t-1");
        assert!(json.get("params").is_none());
    }
}
