//! Plan/coaching lookup seam.
//!
//! Optional external collaborator: opaque text looked up by workflow
//! identifier, consumed only to enrich a continuation's coaching note. Never
//! required for correctness — a miss or failure just drops the note.

use std::collections::HashMap;

use async_trait::async_trait;

/// Looks up coaching text for a workflow.
#[async_trait]
pub trait PlanLookup: Send + Sync {
    async fn coaching_for(&self, workflow: &str) -> Option<String>;
}

/// Fixed in-memory lookup table.
#[derive(Default)]
pub struct StaticPlanLookup {
    plans: HashMap<String, String>,
}

impl StaticPlanLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, workflow: impl Into<String>, coaching: impl Into<String>) -> Self {
        self.plans.insert(workflow.into(), coaching.into());
        self
    }
}

#[async_trait]
impl PlanLookup for StaticPlanLookup {
    async fn coaching_for(&self, workflow: &str) -> Option<String> {
        self.plans.get(workflow).cloned()
    }
}
