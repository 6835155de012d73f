pub mod config;
pub mod counter;
pub mod errors;
pub mod handler_registry;
pub mod memory;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use counter::{AtomicCounter, MemoryAtomicCounter};
pub use errors::{SchedulerError, SchedulerResult};
pub use handler_registry::HandlerRegistry;
pub use memory::MemoryStore;
// 只从models重导出常用类型，避免命名冲突
pub use models::{
    CollisionStrategy, DispatchFailedEvent, DispatchPayload, ExecuteState, Group, Instance, Job,
    JobState, JobType, MisfireStrategy, Operation, Page, RetryType, RouteStrategy, RunState,
    RunType, ServerIdentity, ServerRole, ShutdownStrategy, Task, TaskReport, TriggerType,
};
pub use traits::{
    DispatchEventRepository, ExecuteContext, ExecuteOutcome, GroupRepository, InstanceRepository,
    JobHandler, JobRepository, TaskReporter, TaskRepository,
};
