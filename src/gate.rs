//! Auto-continue gate.
//!
//! Decides, after each round of agent output, whether to deliver the result,
//! pause for human input, or silently re-enqueue a continuation. The two hard
//! rules: an `Error` verdict never auto-continues (prevents crash-retry
//! storms), and the continuation cap breaks any possible infinite silent loop.

use tracing::{debug, info};

use crate::classify::{ClassificationResult, OutputType};
use crate::config::EngineConfig;
use crate::session::{Session, SessionStatus};

/// What to do with one round of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Deliver the output and finalize the session with this status.
    Finalize { status: SessionStatus },
    /// Deliver the output and wait for human input (session goes dormant).
    DeliverAndWait,
    /// Suppress the output and re-enqueue a continuation job.
    Continue { coaching: Option<String> },
}

/// The decision table over a classifier verdict and session state.
pub struct AutoContinueGate {
    cap: u32,
    confidence_floor: f32,
}

impl AutoContinueGate {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            cap: config.auto_continue_cap,
            confidence_floor: config.confidence_floor,
        }
    }

    /// Evaluate one verdict.
    ///
    /// `verdict` is `None` when the classifier was unavailable — that
    /// degrades to the conservative Question path, never to silent
    /// continuation.
    pub fn decide(&self, verdict: Option<&ClassificationResult>, session: &Session) -> GateDecision {
        let Some(result) = verdict else {
            info!(session_id = %session.session_id, "Classifier unavailable; pausing for human");
            return GateDecision::DeliverAndWait;
        };

        // Error is checked before the confidence floor: a crash report is
        // delivered and the session fails no matter how unsure the
        // classifier is.
        if result.output_type == OutputType::Error {
            return GateDecision::Finalize {
                status: SessionStatus::Failed,
            };
        }

        if result.confidence < self.confidence_floor {
            debug!(
                session_id = %session.session_id,
                confidence = result.confidence,
                floor = self.confidence_floor,
                "Low-confidence verdict treated as question"
            );
            return GateDecision::DeliverAndWait;
        }

        // Completion without evidence is behaviorally a status update.
        let effective = match result.output_type {
            OutputType::Completion if !result.evidence_present => {
                debug!(session_id = %session.session_id, "Unevidenced completion treated as status update");
                OutputType::StatusUpdate
            }
            other => other,
        };

        match effective {
            // Error already returned above; the arm keeps the same failure
            // path rather than a panic.
            OutputType::Error => GateDecision::Finalize {
                status: SessionStatus::Failed,
            },
            OutputType::Question | OutputType::Blocker => GateDecision::DeliverAndWait,
            OutputType::Completion => GateDecision::Finalize {
                status: SessionStatus::Completed,
            },
            OutputType::StatusUpdate => {
                if session.auto_continue_count >= self.cap {
                    info!(
                        session_id = %session.session_id,
                        cap = self.cap,
                        "Auto-continue cap reached; delivering verbatim"
                    );
                    return GateDecision::DeliverAndWait;
                }
                GateDecision::Continue { coaching: None }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn session(auto_continue_count: u32) -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4(),
            project_key: "p1".into(),
            conversation: "conv".into(),
            status: SessionStatus::Active,
            origin_sender: "alice".into(),
            created_at: now,
            last_activity: now,
            tool_call_count: 0,
            auto_continue_count,
        }
    }

    fn verdict(output_type: OutputType, confidence: f32, evidence: bool) -> ClassificationResult {
        ClassificationResult {
            output_type,
            confidence,
            evidence_present: evidence,
            reason: "test".into(),
        }
    }

    fn gate() -> AutoContinueGate {
        AutoContinueGate::new(&EngineConfig::default())
    }

    #[test]
    fn error_never_continues_at_any_confidence() {
        for confidence in [0.0, 0.3, 0.59, 0.9, 1.0] {
            let decision = gate().decide(Some(&verdict(OutputType::Error, confidence, false)), &session(0));
            assert_eq!(
                decision,
                GateDecision::Finalize { status: SessionStatus::Failed },
                "confidence {confidence}"
            );
        }
    }

    #[test]
    fn question_and_blocker_pause() {
        for output_type in [OutputType::Question, OutputType::Blocker] {
            let decision = gate().decide(Some(&verdict(output_type, 0.9, false)), &session(0));
            assert_eq!(decision, GateDecision::DeliverAndWait);
        }
    }

    #[test]
    fn evidenced_completion_finalizes() {
        let decision = gate().decide(Some(&verdict(OutputType::Completion, 0.9, true)), &session(0));
        assert_eq!(
            decision,
            GateDecision::Finalize { status: SessionStatus::Completed }
        );
    }

    #[test]
    fn unevidenced_completion_is_a_status_update() {
        let decision = gate().decide(Some(&verdict(OutputType::Completion, 0.9, false)), &session(0));
        assert!(matches!(decision, GateDecision::Continue { .. }));
    }

    #[test]
    fn status_update_continues_until_cap() {
        let gate = gate();
        let verdict = verdict(OutputType::StatusUpdate, 0.9, false);

        assert!(matches!(
            gate.decide(Some(&verdict), &session(2)),
            GateDecision::Continue { .. }
        ));
        // At the cap the output is delivered verbatim.
        assert_eq!(gate.decide(Some(&verdict), &session(3)), GateDecision::DeliverAndWait);
        assert_eq!(gate.decide(Some(&verdict), &session(7)), GateDecision::DeliverAndWait);
    }

    #[test]
    fn low_confidence_pauses_instead_of_continuing() {
        let decision = gate().decide(Some(&verdict(OutputType::StatusUpdate, 0.2, false)), &session(0));
        assert_eq!(decision, GateDecision::DeliverAndWait);
    }

    #[test]
    fn missing_classifier_pauses() {
        assert_eq!(gate().decide(None, &session(0)), GateDecision::DeliverAndWait);
    }
}
