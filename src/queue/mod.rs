//! Job queue — durable records, atomic status transitions, per-project workers.

mod job;
mod store;
mod supervisor;

pub use job::{Job, JobCategory, JobPayload, JobPriority, JobStatus, ABORTED_REASON};
pub use store::JobStore;
pub use supervisor::{JobProcessor, WorkerRegistry, WorkerSupervisor};
