use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::core::agents::ClassificationAgent;
use crate::core::consensus::{self, AgentOutcome};
use crate::core::hub::EventHub;
use crate::core::notify::{CaptureSummary, Notifier};
use crate::core::store::{DeviceRecord, Store};
use crate::core::types::{CaptureEvent, CaptureState};

/// Background classification pipeline: one `evaluate` call per ingested
/// capture, spawned by ingestion after it has already answered the device.
///
/// The pending -> processing claim makes evaluation single-flight per
/// capture: of any number of concurrently spawned tasks for the same id,
/// exactly one proceeds and the rest exit without side effects.
#[derive(Clone)]
pub struct ConsensusEvaluator {
    store: Store,
    events: EventHub,
    agent_a: Arc<dyn ClassificationAgent>,
    agent_b: Arc<dyn ClassificationAgent>,
    notifier: Arc<dyn Notifier>,
    agent_timeout: Duration,
    notification_cooldown: chrono::Duration,
}

impl ConsensusEvaluator {
    pub fn new(
        store: Store,
        events: EventHub,
        agent_a: Arc<dyn ClassificationAgent>,
        agent_b: Arc<dyn ClassificationAgent>,
        notifier: Arc<dyn Notifier>,
        agent_timeout: Duration,
        notification_cooldown: chrono::Duration,
    ) -> Self {
        Self {
            store,
            events,
            agent_a,
            agent_b,
            notifier,
            agent_timeout,
            notification_cooldown,
        }
    }

    pub async fn evaluate(&self, capture_id: &str) -> Result<()> {
        if !self.store.claim_capture_for_evaluation(capture_id).await? {
            debug!("Capture [{}] already claimed, skipping evaluation", capture_id);
            return Ok(());
        }

        // From here on the capture must not be left in `processing`.
        match self.run_claimed(capture_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Evaluation of capture [{}] failed: {}", capture_id, e);
                if let Err(release_err) = self
                    .store
                    .fail_evaluation(capture_id, &format!("internal error: {e}"))
                    .await
                {
                    error!(
                        "Could not release claim on capture [{}]: {}",
                        capture_id, release_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_claimed(&self, capture_id: &str) -> Result<()> {
        let Some(capture) = self.store.get_capture(capture_id).await? else {
            anyhow::bail!("capture row disappeared after claim");
        };
        let Some(device) = self.store.get_device(&capture.device_id).await? else {
            self.store
                .fail_evaluation(capture_id, "device record no longer exists")
                .await?;
            return Ok(());
        };

        let (outcome_a, outcome_b) = tokio::join!(
            self.run_agent(&self.agent_a, &capture.artifact_ref, &device.guidance),
            self.run_agent(&self.agent_b, &capture.artifact_ref, &device.guidance),
        );
        let details = json!({
            self.agent_a.name(): outcome_json(&outcome_a),
            self.agent_b.name(): outcome_json(&outcome_b),
        });

        let Some(result) = consensus::reconcile(&outcome_a, &outcome_b) else {
            self.store
                .fail_evaluation(capture_id, "both classification agents failed")
                .await?;
            self.publish_event(&device, capture_id, "evaluation_failed", None, None);
            return Ok(());
        };

        self.store
            .complete_evaluation(capture_id, result.state, result.score, &result.reason, &details)
            .await?;
        info!(
            "Capture [{}] evaluated: {} (score {:.2})",
            capture_id,
            result.state.as_str(),
            result.score
        );
        self.publish_event(
            &device,
            capture_id,
            "evaluation_completed",
            Some(result.state),
            Some(result.score),
        );

        if result.state == CaptureState::Abnormal {
            self.maybe_notify(&device, capture_id, result.score, &result.reason)
                .await;
        }
        Ok(())
    }

    async fn run_agent(
        &self,
        agent: &Arc<dyn ClassificationAgent>,
        artifact_b64: &str,
        guidance: &str,
    ) -> AgentOutcome {
        match timeout(self.agent_timeout, agent.classify(artifact_b64, guidance)).await {
            Ok(Ok(verdict)) => AgentOutcome::Verdict(verdict),
            Ok(Err(e)) => {
                warn!("Agent [{}] errored: {}", agent.name(), e);
                AgentOutcome::Failed(format!("{}: {}", agent.name(), e))
            }
            Err(_) => {
                warn!(
                    "Agent [{}] timed out after {:?}",
                    agent.name(),
                    self.agent_timeout
                );
                AgentOutcome::Failed(format!("{}: timed out", agent.name()))
            }
        }
    }

    fn publish_event(
        &self,
        device: &DeviceRecord,
        capture_id: &str,
        event: &str,
        state: Option<CaptureState>,
        score: Option<f64>,
    ) {
        let mut evt = CaptureEvent::new(event, &device.org_id, &device.id, capture_id);
        evt.state = state;
        evt.score = score;
        if !self.events.publish(&device.org_id, evt) {
            debug!("No dashboards subscribed for org [{}]", device.org_id);
        }
    }

    async fn maybe_notify(&self, device: &DeviceRecord, capture_id: &str, score: f64, reason: &str) {
        let claimed = match self
            .store
            .claim_notification_slot(&device.id, self.notification_cooldown, Utc::now())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Notification slot check failed for [{}]: {}", device.id, e);
                return;
            }
        };
        if !claimed {
            debug!("Notification for device [{}] suppressed by cooldown", device.id);
            return;
        }

        let summary = CaptureSummary {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            capture_id: capture_id.to_string(),
            score,
            reason: reason.to_string(),
        };
        if let Err(e) = self.notifier.notify(&summary).await {
            warn!("Notification for device [{}] failed: {}", device.id, e);
        }
    }
}

fn outcome_json(outcome: &AgentOutcome) -> serde_json::Value {
    match outcome {
        AgentOutcome::Verdict(v) => json!({
            "state": v.state,
            "confidence": v.confidence,
            "reason": v.reason,
        }),
        AgentOutcome::Failed(err) => json!({ "error": err }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::consensus::AgentVerdict;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::core::types::EvaluationStatus;

    struct StaticAgent {
        name: &'static str,
        state: CaptureState,
        confidence: f64,
        calls: AtomicUsize,
    }

    impl StaticAgent {
        fn new(name: &'static str, state: CaptureState, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                state,
                confidence,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClassificationAgent for StaticAgent {
        fn name(&self) -> &str {
            self.name
        }
        async fn classify(&self, _artifact: &str, _guidance: &str) -> Result<AgentVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentVerdict {
                state: self.state,
                confidence: self.confidence,
                reason: format!("{} verdict", self.name),
            })
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl ClassificationAgent for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }
        async fn classify(&self, _artifact: &str, _guidance: &str) -> Result<AgentVerdict> {
            Err(anyhow!("simulated outage"))
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl ClassificationAgent for SlowAgent {
        fn name(&self) -> &str {
            "slow"
        }
        async fn classify(&self, _artifact: &str, _guidance: &str) -> Result<AgentVerdict> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("test timeout must fire first")
        }
    }

    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _summary: &CaptureSummary) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: Store,
        events: EventHub,
        notifier: Arc<CountingNotifier>,
        device_id: String,
        org_id: String,
    }

    async fn fixture() -> Fixture {
        let store = Store::open_ephemeral().unwrap();
        let device = store
            .create_device("org-1", "cam-a", "an empty loading dock")
            .await
            .unwrap();
        Fixture {
            store,
            events: EventHub::new(),
            notifier: Arc::new(CountingNotifier {
                sent: AtomicUsize::new(0),
            }),
            device_id: device.id,
            org_id: device.org_id,
        }
    }

    fn evaluator(
        fx: &Fixture,
        agent_a: Arc<dyn ClassificationAgent>,
        agent_b: Arc<dyn ClassificationAgent>,
    ) -> ConsensusEvaluator {
        ConsensusEvaluator::new(
            fx.store.clone(),
            fx.events.clone(),
            agent_a,
            agent_b,
            fx.notifier.clone(),
            Duration::from_millis(200),
            chrono::Duration::seconds(60),
        )
    }

    #[tokio::test]
    async fn agreement_completes_and_publishes() {
        let fx = fixture().await;
        let eval = evaluator(
            &fx,
            StaticAgent::new("a", CaptureState::Normal, 0.9),
            StaticAgent::new("b", CaptureState::Normal, 0.7),
        );
        let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();
        let mut events = fx.events.subscribe(&fx.org_id);

        eval.evaluate(&capture.id).await.unwrap();

        let row = fx.store.get_capture(&capture.id).await.unwrap().unwrap();
        assert_eq!(row.evaluation_status, EvaluationStatus::Completed);
        assert_eq!(row.state, Some(CaptureState::Normal));
        assert_eq!(row.score, Some(0.9));
        assert!(row.agent_details.is_some());

        let evt = events.recv().await.unwrap();
        assert_eq!(evt.event, "evaluation_completed");
        assert_eq!(evt.capture_id, capture.id);
        assert_eq!(evt.state, Some(CaptureState::Normal));
        // Normal result: no notification.
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disagreement_is_recorded_uncertain() {
        let fx = fixture().await;
        let eval = evaluator(
            &fx,
            StaticAgent::new("a", CaptureState::Normal, 0.9),
            StaticAgent::new("b", CaptureState::Abnormal, 0.8),
        );
        let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();

        eval.evaluate(&capture.id).await.unwrap();

        let row = fx.store.get_capture(&capture.id).await.unwrap().unwrap();
        assert_eq!(row.state, Some(CaptureState::Uncertain));
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_evaluations_run_once() {
        let fx = fixture().await;
        let agent_a = StaticAgent::new("a", CaptureState::Normal, 0.9);
        let agent_b = StaticAgent::new("b", CaptureState::Normal, 0.9);
        let eval = evaluator(&fx, agent_a.clone(), agent_b.clone());
        let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();

        let (r1, r2, r3) = tokio::join!(
            eval.evaluate(&capture.id),
            eval.evaluate(&capture.id),
            eval.evaluate(&capture.id),
        );
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();

        // Only the winning claim invoked the agents.
        assert_eq!(agent_a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent_b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn both_agents_failing_marks_failed() {
        let fx = fixture().await;
        let eval = evaluator(&fx, Arc::new(FailingAgent), Arc::new(SlowAgent));
        let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();
        let mut events = fx.events.subscribe(&fx.org_id);

        eval.evaluate(&capture.id).await.unwrap();

        let row = fx.store.get_capture(&capture.id).await.unwrap().unwrap();
        assert_eq!(row.evaluation_status, EvaluationStatus::Failed);
        assert!(row.reason.unwrap().contains("both"));
        assert_eq!(events.recv().await.unwrap().event, "evaluation_failed");
    }

    #[tokio::test]
    async fn timed_out_agent_leaves_survivor_rule() {
        let fx = fixture().await;
        let eval = evaluator(
            &fx,
            StaticAgent::new("a", CaptureState::Abnormal, 0.95),
            Arc::new(SlowAgent),
        );
        let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();

        eval.evaluate(&capture.id).await.unwrap();

        let row = fx.store.get_capture(&capture.id).await.unwrap().unwrap();
        assert_eq!(row.evaluation_status, EvaluationStatus::Completed);
        // Confident survivor carries abnormal, which also notifies.
        assert_eq!(row.state, Some(CaptureState::Abnormal));
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notification_cooldown_suppresses_second_alert() {
        let fx = fixture().await;
        let eval = evaluator(
            &fx,
            StaticAgent::new("a", CaptureState::Abnormal, 0.9),
            StaticAgent::new("b", CaptureState::Abnormal, 0.8),
        );

        for _ in 0..2 {
            let capture = fx.store.create_capture(&fx.device_id, None, "img").await.unwrap();
            eval.evaluate(&capture.id).await.unwrap();
        }

        // Two abnormal evaluations inside one cooldown window: one alert.
        assert_eq!(fx.notifier.sent.load(Ordering::SeqCst), 1);
    }
}
