//! Output classification.
//!
//! The engine consumes the classifier only through its typed result; the
//! verdict set is a closed enum, never a bare string. A pluggable LLM-backed
//! implementation lives outside this crate; the regex heuristic here is the
//! fallback and the default for tests.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClassifierError;

/// What one round of agent output amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// The agent needs an answer from the human.
    Question,
    /// Progress narration; the work is not finished.
    StatusUpdate,
    /// The agent claims the work is finished.
    Completion,
    /// The agent cannot proceed without outside help.
    Blocker,
    /// The agent crashed or reported a hard error.
    Error,
}

/// The verdict on one round of agent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub output_type: OutputType,
    /// In [0, 1]. Verdicts below the configured floor are not trusted.
    pub confidence: f32,
    /// Whether the output contains concrete evidence (test results, diffs,
    /// exit codes). A `Completion` without evidence is never finalized as-is.
    pub evidence_present: bool,
    pub reason: String,
}

/// Labels agent output. External collaborator; unavailability degrades to
/// the conservative "treat as Question" path in the engine, never to silent
/// continuation.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, raw_output: &str) -> Result<ClassificationResult, ClassifierError>;
}

/// Regex-based fallback classifier.
///
/// Rule order is the priority order: hard errors first, then questions and
/// blockers (both pause for a human), then completion claims, and everything
/// else is a status update.
pub struct HeuristicClassifier {
    error: Regex,
    question: Regex,
    blocker: Regex,
    completion: Regex,
    evidence: Regex,
    hedging: Regex,
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self {
            error: Regex::new(
                r"(?i)\b(error|exception|traceback|panicked|fatal|crashed|stack trace)\b",
            )
            .expect("static regex"),
            question: Regex::new(
                r"(?i)(\?\s*$|\bshould i\b|\bdo you want\b|\bwhich (one|option|approach)\b|\bplease (confirm|clarify)\b)",
            )
            .expect("static regex"),
            blocker: Regex::new(
                r"(?i)\b(blocked|cannot proceed|can't proceed|need (access|credentials|permission)|permission denied|waiting on|unable to continue)\b",
            )
            .expect("static regex"),
            completion: Regex::new(
                r"(?i)\b(completed?|done|finished|implemented|fixed|resolved|deployed)\b",
            )
            .expect("static regex"),
            evidence: Regex::new(
                r"(?i)\b(tests? (pass|passed|passing)|all (tests|checks) (pass|green)|exit code 0|committed|pushed|diff|verified|output:|build succeeded)\b",
            )
            .expect("static regex"),
            hedging: Regex::new(
                r"(?i)\b(should (now )?work|probably|likely|i (think|believe)|attempted|tried to|hopefully|might)\b",
            )
            .expect("static regex"),
        }
    }
}

#[async_trait]
impl Classifier for HeuristicClassifier {
    async fn classify(&self, raw_output: &str) -> Result<ClassificationResult, ClassifierError> {
        let result = if self.error.is_match(raw_output) {
            ClassificationResult {
                output_type: OutputType::Error,
                confidence: 0.9,
                evidence_present: true,
                reason: "error pattern matched".into(),
            }
        } else if self.question.is_match(raw_output) {
            ClassificationResult {
                output_type: OutputType::Question,
                confidence: 0.8,
                evidence_present: false,
                reason: "question pattern matched".into(),
            }
        } else if self.blocker.is_match(raw_output) {
            ClassificationResult {
                output_type: OutputType::Blocker,
                confidence: 0.8,
                evidence_present: false,
                reason: "blocker pattern matched".into(),
            }
        } else if self.completion.is_match(raw_output) {
            let hedged = self.hedging.is_match(raw_output);
            let evidence = self.evidence.is_match(raw_output) && !hedged;
            ClassificationResult {
                output_type: OutputType::Completion,
                confidence: if hedged { 0.65 } else { 0.85 },
                evidence_present: evidence,
                reason: if hedged {
                    "completion claim with hedging language".into()
                } else {
                    "completion claim".into()
                },
            }
        } else {
            ClassificationResult {
                output_type: OutputType::StatusUpdate,
                confidence: 0.7,
                evidence_present: false,
                reason: "no terminal pattern matched".into(),
            }
        };

        debug!(output_type = ?result.output_type, confidence = result.confidence, "Heuristic classification");
        Ok(result)
    }
}
