pub mod changes;
pub mod lifecycle;
pub mod orchestrator;
pub mod overlap;
pub mod queue;
pub mod registry;
pub mod research;
pub mod scheduling;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use lifecycle::{ExecutionError, ExecutionOutcome, JobLifecycleManager};
pub use orchestrator::{validate_scopes, Orchestrator, SubmitRequest};
pub use overlap::OverlapGuard;
pub use queue::{
    connect_queue, BrokerClient, BrokerQueue, BrokerWorker, JobHandle, JobPayload, QueueBackend,
    QueueError, QueueGateway, StoreQueue,
};
pub use registry::{ProgramRegistry, UpsertOutcome};
pub use research::{HttpResearcher, Researcher};
pub use scheduling::{
    next_fire, JobSubmitter, PollReport, ScheduleEngine, ScheduleRequest, ScheduleUpdate,
};
