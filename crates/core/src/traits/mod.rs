pub mod handler;
pub mod repository;

pub use handler::{ExecuteContext, ExecuteOutcome, JobHandler, TaskReporter};
pub use repository::{
    DispatchEventRepository, GroupRepository, InstanceRepository, JobRepository, TaskRepository,
};
