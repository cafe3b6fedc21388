pub mod job;
pub mod queue;
pub mod registry;

pub use job::{Job, JobId, JobState};
pub use queue::JobStore;
pub use registry::{WorkerEntry, WorkerInfo, WorkerRegistry};
