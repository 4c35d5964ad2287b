//! Outbound delivery seam.
//!
//! Chat/transport adapters implement this; the engine only ever calls
//! `deliver`. Delivery is not exactly-once — a failed send is logged and the
//! queue state is unaffected.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::DeliveryError;

/// Delivers agent output to the human behind a session.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, session_id: Uuid, text: &str) -> Result<(), DeliveryError>;
}

/// Logs deliveries. Default when no transport adapter is wired.
pub struct TracingDelivery;

#[async_trait]
impl Delivery for TracingDelivery {
    async fn deliver(&self, session_id: Uuid, text: &str) -> Result<(), DeliveryError> {
        info!(session_id = %session_id, "deliver: {text}");
        Ok(())
    }
}
