pub mod lifecycle;
pub mod router;
pub mod scan_loop;
pub mod splitter;
pub mod trigger_time;

pub use lifecycle::LifecycleService;
pub use router::ExecutionRouter;
pub use scan_loop::{run_scan_loop, SupervisorEngine};
pub use splitter::{InstanceAttach, JobSplitter};

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{
    DispatchPayload, Instance, Job, Operation, ShutdownStrategy, Task,
};
use disched_core::traits::GroupRepository;

/// 构造派发线协议载荷；task必须已完成路由
pub(crate) fn build_payload(
    job: &Job,
    instance: &Instance,
    task: &Task,
    operation: Operation,
    supervisor_token: String,
) -> SchedulerResult<DispatchPayload> {
    let worker = task
        .worker
        .clone()
        .ok_or_else(|| SchedulerError::DispatchFailed(format!("任务 {} 未指派Worker", task.id)))?;
    Ok(DispatchPayload {
        operation,
        task_id: task.id,
        task_no: task.task_no,
        task_count: task.task_count,
        instance_id: instance.id,
        workflow_instance_id: instance.workflow_instance_id,
        trigger_time: instance.trigger_time,
        job_id: job.id,
        job_type: job.job_type,
        job_handler: splitter::handler_name(job, instance),
        task_param: task.param.clone(),
        route_strategy: job.route_strategy,
        shutdown_strategy: ShutdownStrategy::Resume,
        execute_timeout_ms: job.execute_timeout_ms,
        supervisor_token,
        worker,
    })
}

/// 分组的supervisor侧凭据；分组未配置时为空串
pub(crate) async fn group_supervisor_token(groups: &dyn GroupRepository, group: &str) -> String {
    match groups.get(group).await {
        Ok(Some(g)) => g.supervisor_token,
        _ => String::new(),
    }
}
