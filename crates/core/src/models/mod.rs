pub mod dag;
pub mod dispatch;
pub mod event;
pub mod group;
pub mod instance;
pub mod job;
pub mod server;
pub mod task;

pub use dag::{DagGraph, DagNode};
pub use dispatch::{DispatchPayload, Operation, ShutdownStrategy, TaskReport};
pub use event::DispatchFailedEvent;
pub use group::Group;
pub use instance::{Instance, RunState, RunType};
pub use job::{
    CollisionStrategy, Job, JobState, JobType, MisfireStrategy, RetryType, RouteStrategy,
    TriggerType,
};
pub use server::{ServerIdentity, ServerRole};
pub use task::{ExecuteState, Task};

use serde::{Deserialize, Serialize};

/// 分页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, page_size: i64) -> Self {
        Self {
            items,
            total,
            page,
            page_size,
        }
    }

    pub fn empty(page: i64, page_size: i64) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page,
            page_size,
        }
    }
}

/// 任务分页查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPageQuery {
    pub group: Option<String>,
    pub name_like: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// 实例分页查询条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePageQuery {
    pub job_id: Option<i64>,
    pub run_state: Option<RunState>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}
