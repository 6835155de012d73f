use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{
    CollisionStrategy, Instance, Job, Operation, RunState, RunType, ServerRole,
};
use disched_core::traits::{
    DispatchEventRepository, GroupRepository, InstanceRepository, JobRepository, TaskRepository,
};
use disched_dispatch::ReliableDispatcher;
use disched_registry::ServerRegistry;

use crate::lifecycle::LifecycleService;
use crate::router::ExecutionRouter;
use crate::splitter::{handler_name, InstanceAttach, JobSplitter};
use crate::trigger_time;

/// 扫描循环引擎：supervisor的控制中枢
///
/// 每个心跳周期跑三条通道：
/// 1. 到期触发——认领到期job（乐观锁单胜者）、碰撞判定、建实例并派发；
/// 2. 到期实例——拉起WAITING且时间已到的实例（串行队列、重试、DAG后继）；
/// 3. 派发恢复——消费派发失败事件，按最新发现快照重新路由再派发。
pub struct SupervisorEngine {
    jobs: Arc<dyn JobRepository>,
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    events: Arc<dyn DispatchEventRepository>,
    groups: Arc<dyn GroupRepository>,
    splitter: JobSplitter,
    router: ExecutionRouter,
    dispatcher: Arc<ReliableDispatcher>,
    registry: Arc<dyn ServerRegistry>,
    lifecycle: Arc<LifecycleService>,
    scan_batch_size: usize,
}

impl SupervisorEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        instances: Arc<dyn InstanceRepository>,
        tasks: Arc<dyn TaskRepository>,
        events: Arc<dyn DispatchEventRepository>,
        groups: Arc<dyn GroupRepository>,
        splitter: JobSplitter,
        router: ExecutionRouter,
        dispatcher: Arc<ReliableDispatcher>,
        registry: Arc<dyn ServerRegistry>,
        lifecycle: Arc<LifecycleService>,
        scan_batch_size: usize,
    ) -> Self {
        Self {
            jobs,
            instances,
            tasks,
            events,
            groups,
            splitter,
            router,
            dispatcher,
            registry,
            lifecycle,
            scan_batch_size,
        }
    }

    pub fn lifecycle(&self) -> Arc<LifecycleService> {
        self.lifecycle.clone()
    }

    /// 执行一轮扫描；单条通道的失败不影响其余通道
    pub async fn scan_once(&self, now: DateTime<Utc>) {
        if let Err(e) = self.process_due_jobs(now).await {
            warn!("到期触发通道失败: {e}");
        }
        if let Err(e) = self.process_waiting_due(now).await {
            warn!("到期实例通道失败: {e}");
        }
        if let Err(e) = self.recover_dispatch_failures().await {
            warn!("派发恢复通道失败: {e}");
        }
    }

    /// 通道1：扫描到期job并认领触发
    async fn process_due_jobs(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let due = self.jobs.find_due(now, self.scan_batch_size).await?;
        for job in due {
            let Some(fire) = job.next_trigger_time else {
                continue;
            };
            let next = match trigger_time::next_trigger_time(&job, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!("任务 {} 触发时间计算失败: {e}", job.id);
                    continue;
                }
            };
            // 认领是单次条件更新：并发副本恰有一个成功，落败方放弃本轮
            if !self
                .jobs
                .claim_trigger(job.id, job.version, fire, next)
                .await?
            {
                debug!("任务 {} 被其他supervisor认领", job.id);
                continue;
            }
            if let Err(e) = self.trigger_job(&job, fire, RunType::Scheduled).await {
                warn!("任务 {} 触发失败: {e}", job.id);
            }
        }
        Ok(())
    }

    /// 触发一次job执行：碰撞判定在建task之前完成
    ///
    /// 返回创建的实例id；DISCARD碰撞下返回None。
    pub async fn trigger_job(
        &self,
        job: &Job,
        trigger_time: DateTime<Utc>,
        run_type: RunType,
    ) -> SchedulerResult<Option<i64>> {
        let active = self.instances.find_active_by_job(job.id).await?;
        if !active.is_empty() {
            match job.collision_strategy {
                CollisionStrategy::Discard => {
                    debug!("任务 {} 上一实例未终止，本次触发丢弃", job.id);
                    return Ok(None);
                }
                CollisionStrategy::Serial => {
                    // 入队：WAITING实例等待前序实例终止后由到期通道拉起
                    let queued = self.create_instance(job, trigger_time, run_type).await?;
                    info!("任务 {} 触发已串行入队: 实例 {}", job.id, queued.id);
                    return Ok(Some(queued.id));
                }
                CollisionStrategy::Override => {
                    for prior in &active {
                        self.lifecycle.cancel_instance(prior.id).await?;
                    }
                }
                CollisionStrategy::Parallel => {}
            }
        }
        let instance = self.create_instance(job, trigger_time, run_type).await?;
        let id = instance.id;
        self.launch_instance(job, instance).await?;
        Ok(Some(id))
    }

    async fn create_instance(
        &self,
        job: &Job,
        trigger_time: DateTime<Utc>,
        run_type: RunType,
    ) -> SchedulerResult<Instance> {
        let mut instance = Instance::new(job.id, trigger_time, run_type);
        if job.is_workflow() {
            // 哨兵值：存储在创建时回填为实例自身id
            instance.workflow_instance_id = Some(0);
        }
        self.instances.create(&instance).await
    }

    /// 拉起一个WAITING实例：分裂、路由、派发
    ///
    /// 无可用Worker时保持WAITING，下一轮扫描重试；分裂失败是实例级
    /// 失败，置FAILED且不产生task。
    async fn launch_instance(&self, job: &Job, instance: Instance) -> SchedulerResult<()> {
        if instance.is_workflow_parent() {
            return self.launch_workflow_parent(job, instance).await;
        }

        let mut tasks = self.tasks.find_by_instance(instance.id).await?;
        if tasks.is_empty() {
            let attach = InstanceAttach::parse(instance.attach.as_deref());
            let new_tasks = if let Some(params) = attach.retry_params {
                self.splitter.tasks_from_params(instance.id, &params)
            } else {
                match self
                    .splitter
                    .split_tasks(job, &handler_name(job, &instance), instance.id)
                {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        warn!("实例 {} 分裂失败: {e}", instance.id);
                        self.instances
                            .update_state(instance.id, RunState::Waiting, RunState::Failed)
                            .await?;
                        return Ok(());
                    }
                }
            };
            tasks = self.tasks.create_batch(&new_tasks).await?;
        }

        let workers = self.registry.discover(ServerRole::Worker, &job.group).await?;
        match self
            .router
            .route(job.route_strategy, &mut tasks, &workers)
            .await
        {
            Ok(()) => {}
            Err(SchedulerError::NoAvailableWorker(_)) => {
                debug!("任务 {} 无可用Worker，实例 {} 留待下一轮", job.id, instance.id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        for task in &tasks {
            self.tasks.update(task).await?;
        }
        self.instances
            .update_state(instance.id, RunState::Waiting, RunState::Running)
            .await?;

        let token = crate::group_supervisor_token(self.groups.as_ref(), &job.group).await;
        for task in &tasks {
            let payload =
                crate::build_payload(job, &instance, task, Operation::Trigger, token.clone())?;
            // 投递失败在派发器内转为事件，由恢复通道接管
            self.dispatcher.dispatch(&payload).await?;
        }
        info!("实例 {} 已派发 {} 个task", instance.id, tasks.len());
        Ok(())
    }

    /// workflow父实例：自身无task，推入RUNNING并拉起DAG初始节点
    async fn launch_workflow_parent(&self, job: &Job, parent: Instance) -> SchedulerResult<()> {
        let graph = self.splitter.parse_workflow(job)?;
        self.instances
            .update_state(parent.id, RunState::Waiting, RunState::Running)
            .await?;
        for node_id in graph.initial_nodes() {
            let attach = InstanceAttach {
                node: Some(graph.node(node_id).key()),
                ..Default::default()
            };
            let mut child = Instance::new(job.id, parent.trigger_time, RunType::Depend);
            child.parent_instance_id = Some(parent.id);
            child.workflow_instance_id = Some(parent.id);
            child.attach = attach.encode()?;
            let created = self.instances.create(&child).await?;
            Box::pin(self.launch_instance(job, created)).await?;
        }
        Ok(())
    }

    /// 通道2：拉起WAITING且trigger_time已到的实例
    async fn process_waiting_due(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let due = self
            .instances
            .find_waiting_due(now, self.scan_batch_size)
            .await?;
        for instance in due {
            let Some(job) = self.jobs.get_by_id(instance.job_id).await? else {
                continue;
            };
            // 串行队列：前序实例未终止时继续排队；更早入队的WAITING实例优先。
            // workflow子节点不受此门控（它们从属于运行中的父实例）
            if job.collision_strategy == CollisionStrategy::Serial && !instance.is_workflow_node()
            {
                let siblings = self.instances.find_active_by_job(job.id).await?;
                let blocked = siblings.iter().any(|s| {
                    s.id != instance.id
                        && (s.run_state != RunState::Waiting || s.id < instance.id)
                });
                if blocked {
                    continue;
                }
            }
            if let Err(e) = self.launch_instance(&job, instance).await {
                warn!("到期实例拉起失败: {e}");
            }
        }
        Ok(())
    }

    /// 通道3：消费派发失败事件，按最新发现快照重新路由再派发
    async fn recover_dispatch_failures(&self) -> SchedulerResult<()> {
        let events = self.events.drain(self.scan_batch_size).await?;
        for event in events {
            let Some(mut task) = self.tasks.get_by_id(event.task_id).await? else {
                continue;
            };
            if task.is_terminal() {
                continue;
            }
            let Some(instance) = self.instances.get_by_id(event.instance_id).await? else {
                continue;
            };
            if instance.is_terminal() || instance.run_state == RunState::Paused {
                continue;
            }
            let Some(job) = self.jobs.get_by_id(event.job_id).await? else {
                continue;
            };

            let workers = self.registry.discover(ServerRole::Worker, &job.group).await?;
            match self
                .router
                .route(job.route_strategy, std::slice::from_mut(&mut task), &workers)
                .await
            {
                Ok(()) => {}
                Err(SchedulerError::NoAvailableWorker(_)) => {
                    // 仍无可用Worker，事件回队下一轮再试
                    self.events.record(event).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let Some(worker) = task.worker.clone() else {
                continue;
            };
            self.tasks.reassign_workers(&[task.id], &worker).await?;
            task.dispatch_failed_count += 1;
            self.tasks.update(&task).await?;

            let token = crate::group_supervisor_token(self.groups.as_ref(), &job.group).await;
            let payload =
                crate::build_payload(&job, &instance, &task, Operation::Trigger, token)?;
            info!("任务 {} 改派至 {worker} 重新派发", task.id);
            self.dispatcher.dispatch(&payload).await?;
        }
        Ok(())
    }

    /// 手动触发（管理API入口）；DISCARD碰撞时返回None
    pub async fn trigger_job_now(&self, job_id: i64) -> SchedulerResult<Option<i64>> {
        let job = self
            .jobs
            .get_by_id(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;
        if !job.is_enabled() {
            return Err(SchedulerError::invalid_params(format!(
                "任务 {job_id} 处于禁用状态"
            )));
        }
        self.trigger_job(&job, Utc::now(), RunType::Manual).await
    }
}

/// 启动扫描循环后台任务
pub fn run_scan_loop(
    engine: Arc<SupervisorEngine>,
    scan_interval_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(scan_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("扫描循环启动，间隔 {scan_interval_ms}ms");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.scan_once(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("扫描循环退出");
                    break;
                }
            }
        }
    })
}
