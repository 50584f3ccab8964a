mod gemini;
mod openai;

pub use gemini::GeminiVisionAgent;
pub use openai::OpenAiVisionAgent;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::core::consensus::AgentVerdict;
use crate::core::types::CaptureState;

/// One independent image classifier. The evaluator always runs two of these
/// and reconciles their verdicts; implementations must not coordinate.
#[async_trait]
pub trait ClassificationAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Classifies one artifact against the device's guidance text. Agents
    /// return only `normal` or `abnormal`; `uncertain` is a consensus-level
    /// outcome, never an agent-level one.
    async fn classify(&self, artifact_b64: &str, guidance: &str) -> Result<AgentVerdict>;
}

pub fn build_agent(config: &AgentConfig) -> Result<Arc<dyn ClassificationAgent>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiVisionAgent::new(config))),
        "gemini" => Ok(Arc::new(GeminiVisionAgent::new(config))),
        other => Err(anyhow!("Unknown agent provider: {}", other)),
    }
}

pub(crate) fn classification_prompt(guidance: &str) -> String {
    format!(
        "You are inspecting an image from a monitoring camera. \
         Normal for this device means: {}\n\
         Respond with strict JSON only, no prose, in the form \
         {{\"state\": \"normal\" or \"abnormal\", \"confidence\": 0.0-1.0, \"reason\": \"short explanation\"}}",
        if guidance.is_empty() { "no anomalies visible" } else { guidance }
    )
}

#[derive(Deserialize)]
struct RawVerdict {
    state: String,
    confidence: f64,
    reason: String,
}

/// Parses the model's reply into a verdict, tolerating markdown code fences
/// around the JSON body.
pub(crate) fn parse_verdict(raw: &str) -> Result<AgentVerdict> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let parsed: RawVerdict = serde_json::from_str(body)
        .map_err(|e| anyhow!("Agent returned unparseable verdict: {} ({})", e, body))?;

    let state = match parsed.state.as_str() {
        "normal" => CaptureState::Normal,
        "abnormal" => CaptureState::Abnormal,
        other => return Err(anyhow!("Agent returned unknown state: {}", other)),
    };

    Ok(AgentVerdict {
        state,
        confidence: parsed.confidence,
        reason: parsed.reason,
    })
}
