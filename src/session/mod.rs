//! Session lifecycle and live steering.

mod steering;
mod tracker;

pub use steering::{SteeringChannel, SteeringMessage};
pub use tracker::{Session, SessionStatus, SessionTracker};
