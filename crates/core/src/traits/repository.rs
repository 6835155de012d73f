use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SchedulerResult;
use crate::models::{
    DispatchFailedEvent, ExecuteState, Group, Instance, InstancePageQuery, Job, JobPageQuery,
    JobState, Page, RunState, ServerIdentity, Task,
};

/// Job持久化接口（抽象的持久存储，具体映射/SQL在本系统范围之外）
///
/// 所有带版本参数的更新都是条件更新：版本不匹配返回`Ok(false)`，
/// 调用方（扫描循环）放弃本轮认领，不做重试。
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> SchedulerResult<Job>;

    /// 按version乐观锁更新整行，成功时version+1
    async fn update(&self, job: &Job) -> SchedulerResult<bool>;

    async fn delete(&self, job_id: i64) -> SchedulerResult<bool>;

    async fn get_by_id(&self, job_id: i64) -> SchedulerResult<Option<Job>>;

    async fn update_state(&self, job_id: i64, to: JobState) -> SchedulerResult<bool>;

    /// 到期任务扫描：state=ENABLED且next_trigger_time<=now
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Job>>;

    /// 认领触发：单次条件更新（version匹配）内推进last/next_trigger_time。
    /// 两个supervisor副本并发扫描同一到期任务时恰有一个成功。
    async fn claim_trigger(
        &self,
        job_id: i64,
        version: i32,
        last_trigger_time: DateTime<Utc>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool>;

    /// 非竞争路径的next_trigger_time回填（如FIXED_DELAY完成时重新armed）
    async fn update_next_trigger_time(
        &self,
        job_id: i64,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool>;

    async fn page_query(&self, query: &JobPageQuery) -> SchedulerResult<Page<Job>>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: &Instance) -> SchedulerResult<Instance>;

    async fn get_by_id(&self, instance_id: i64) -> SchedulerResult<Option<Instance>>;

    /// 条件状态迁移：当前状态等于from时置为to，返回是否生效
    async fn update_state(
        &self,
        instance_id: i64,
        from: RunState,
        to: RunState,
    ) -> SchedulerResult<bool>;

    async fn update(&self, instance: &Instance) -> SchedulerResult<bool>;

    /// 某job的全部非终态实例（碰撞策略判定）
    async fn find_active_by_job(&self, job_id: i64) -> SchedulerResult<Vec<Instance>>;

    /// WAITING状态且trigger_time已到的实例（串行队列、重试实例）
    async fn find_waiting_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Instance>>;

    /// workflow父实例的全部子节点实例
    async fn find_children(&self, workflow_instance_id: i64) -> SchedulerResult<Vec<Instance>>;

    async fn page_query(&self, query: &InstancePageQuery) -> SchedulerResult<Page<Instance>>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 分裂产生的task批量落库
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<Vec<Task>>;

    async fn get_by_id(&self, task_id: i64) -> SchedulerResult<Option<Task>>;

    async fn find_by_instance(&self, instance_id: i64) -> SchedulerResult<Vec<Task>>;

    /// 条件状态迁移，带结果/错误快照
    async fn update_state(
        &self,
        task_id: i64,
        from: ExecuteState,
        to: ExecuteState,
        result: Option<String>,
        error_msg: Option<String>,
    ) -> SchedulerResult<bool>;

    async fn update(&self, task: &Task) -> SchedulerResult<bool>;

    /// 恢复通道批量改派Worker
    async fn reassign_workers(
        &self,
        task_ids: &[i64],
        worker: &ServerIdentity,
    ) -> SchedulerResult<bool>;
}

/// 派发失败事件的记录与消费
#[async_trait]
pub trait DispatchEventRepository: Send + Sync {
    async fn record(&self, event: DispatchFailedEvent) -> SchedulerResult<()>;

    /// 取走（并移除）一批待恢复事件
    async fn drain(&self, limit: usize) -> SchedulerResult<Vec<DispatchFailedEvent>>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get(&self, name: &str) -> SchedulerResult<Option<Group>>;

    async fn upsert(&self, group: Group) -> SchedulerResult<()>;

    async fn list(&self) -> SchedulerResult<Vec<Group>>;
}
