use serde::{Deserialize, Serialize};

use crate::core::types::CaptureState;

/// A lone surviving agent must be at least this confident to carry the
/// verdict alone; below the floor the result is downgraded to `uncertain`.
pub const SOLO_CONFIDENCE_FLOOR: f64 = 0.8;

/// What a single classification agent reported for one capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVerdict {
    pub state: CaptureState,
    pub confidence: f64,
    pub reason: String,
}

/// One agent's contribution to consensus: a verdict, or the reason it
/// produced none (error or timeout).
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Verdict(AgentVerdict),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub state: CaptureState,
    pub score: f64,
    pub reason: String,
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 }
}

/// Reconciles two independent agent outcomes into one verdict.
///
/// Rules, in order:
/// - both agents agree on a state: that state wins, score is the higher
///   confidence, both reasons are kept;
/// - both return verdicts but disagree: `uncertain` regardless of either
///   confidence, score is the lower confidence, both reasons are kept;
/// - exactly one agent survived: its state carries only when its confidence
///   reaches [`SOLO_CONFIDENCE_FLOOR`], otherwise `uncertain`;
/// - both failed: `None` — the evaluation as a whole has failed.
///
/// Confidences are opaque and never averaged or otherwise combined across
/// agents; agreement is decided on the discrete state alone.
pub fn reconcile(a: &AgentOutcome, b: &AgentOutcome) -> Option<ConsensusResult> {
    match (a, b) {
        (AgentOutcome::Verdict(va), AgentOutcome::Verdict(vb)) => {
            let ca = clamp_confidence(va.confidence);
            let cb = clamp_confidence(vb.confidence);
            let reason = format!("agent A: {} | agent B: {}", va.reason, vb.reason);
            if va.state == vb.state {
                Some(ConsensusResult {
                    state: va.state,
                    score: ca.max(cb),
                    reason,
                })
            } else {
                Some(ConsensusResult {
                    state: CaptureState::Uncertain,
                    score: ca.min(cb),
                    reason: format!(
                        "agents disagree ({} vs {}) | {}",
                        va.state.as_str(),
                        vb.state.as_str(),
                        reason
                    ),
                })
            }
        }
        (AgentOutcome::Verdict(v), AgentOutcome::Failed(err))
        | (AgentOutcome::Failed(err), AgentOutcome::Verdict(v)) => {
            let confidence = clamp_confidence(v.confidence);
            let state = if confidence >= SOLO_CONFIDENCE_FLOOR {
                v.state
            } else {
                CaptureState::Uncertain
            };
            Some(ConsensusResult {
                state,
                score: confidence,
                reason: format!("one agent failed ({}) | surviving agent: {}", err, v.reason),
            })
        }
        (AgentOutcome::Failed(ea), AgentOutcome::Failed(eb)) => {
            tracing::warn!("Both classification agents failed: {} / {}", ea, eb);
            None
        }
    }
}
