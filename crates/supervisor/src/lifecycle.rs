use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{
    DispatchFailedEvent, ExecuteState, Instance, Job, Operation, RetryType, RunState, RunType,
    Task, TaskReport, TriggerType,
};
use disched_core::traits::{
    DispatchEventRepository, GroupRepository, InstanceRepository, JobRepository, TaskReporter,
    TaskRepository,
};
use disched_dispatch::ReliableDispatcher;

use crate::splitter::InstanceAttach;
use crate::trigger_time;

/// 实例/任务生命周期服务
///
/// 接收Worker汇报并推进状态机：task终态聚合出实例终态，失败按重试
/// 策略生成重试实例，workflow节点完成后推进DAG后继，FIXED_DELAY在
/// 实例完成时重新armed。重试实例与DAG后继都以WAITING实例落库，由
/// 扫描循环的到期通道统一拉起，派发路径只有一条。
pub struct LifecycleService {
    jobs: Arc<dyn JobRepository>,
    instances: Arc<dyn InstanceRepository>,
    tasks: Arc<dyn TaskRepository>,
    events: Arc<dyn DispatchEventRepository>,
    groups: Arc<dyn GroupRepository>,
    dispatcher: Arc<ReliableDispatcher>,
}

impl LifecycleService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        instances: Arc<dyn InstanceRepository>,
        tasks: Arc<dyn TaskRepository>,
        events: Arc<dyn DispatchEventRepository>,
        groups: Arc<dyn GroupRepository>,
        dispatcher: Arc<ReliableDispatcher>,
    ) -> Self {
        Self {
            jobs,
            instances,
            tasks,
            events,
            groups,
            dispatcher,
        }
    }

    /// 处理一条Worker执行汇报
    ///
    /// 终态优先：实例已终止后到达的迟到汇报直接忽略（而非覆盖写入）。
    pub async fn handle_report(&self, report: &TaskReport) -> SchedulerResult<()> {
        let task = self
            .tasks
            .get_by_id(report.task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: report.task_id })?;
        let instance = self
            .instances
            .get_by_id(task.instance_id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound { id: task.instance_id })?;
        let job = self
            .jobs
            .get_by_id(instance.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: instance.job_id })?;
        self.authorize(&job, &report.supervisor_token).await?;

        if instance.is_terminal() || task.is_terminal() {
            debug!(
                "忽略迟到汇报: task={} 实例已终止或任务已终态",
                report.task_id
            );
            return Ok(());
        }
        if !task.execute_state.can_transition_to(report.to_state) {
            return Err(SchedulerError::IllegalStateTransition {
                from: format!("{:?}", task.execute_state),
                to: format!("{:?}", report.to_state),
            });
        }

        let applied = self
            .tasks
            .update_state(
                report.task_id,
                task.execute_state,
                report.to_state,
                report.result.clone(),
                report.error_msg.clone(),
            )
            .await?;
        if !applied {
            // 与其他supervisor的并发推进撞车，放弃本条
            debug!("汇报条件更新未生效: task={}", report.task_id);
            return Ok(());
        }

        match report.to_state {
            ExecuteState::Executing => {
                // 首个开始执行的task把实例推入RUNNING
                self.instances
                    .update_state(instance.id, RunState::Waiting, RunState::Running)
                    .await?;
                Ok(())
            }
            state if state.is_terminal() => self.on_task_terminal(&job, instance.id).await,
            _ => Ok(()),
        }
    }

    /// group配置存在时校验supervisor_token；未建组的联调环境跳过
    async fn authorize(&self, job: &Job, token: &str) -> SchedulerResult<()> {
        if let Some(group) = self.groups.get(&job.group).await? {
            if group.supervisor_token != token {
                return Err(SchedulerError::Unauthorized(format!(
                    "分组 {} 的supervisor凭据不匹配",
                    job.group
                )));
            }
        }
        Ok(())
    }

    /// 某task进入终态后的聚合：全部终态才推进实例
    async fn on_task_terminal(&self, job: &Job, instance_id: i64) -> SchedulerResult<()> {
        let all_tasks = self.tasks.find_by_instance(instance_id).await?;
        if all_tasks.iter().any(|t| !t.is_terminal()) {
            return Ok(());
        }
        let Some(instance) = self.instances.get_by_id(instance_id).await? else {
            return Ok(());
        };
        if instance.is_terminal() {
            return Ok(());
        }

        let aggregated = if all_tasks
            .iter()
            .any(|t| t.execute_state == ExecuteState::Canceled)
        {
            RunState::Canceled
        } else if all_tasks
            .iter()
            .any(|t| t.execute_state == ExecuteState::Failed)
        {
            RunState::Failed
        } else {
            RunState::Finished
        };

        match aggregated {
            RunState::Failed if job.retry_budget_remains(instance.retried_count) => {
                self.finish_instance(instance.id, RunState::Failed).await?;
                self.spawn_retry_instance(job, &instance, &all_tasks).await?;
            }
            RunState::Finished => {
                self.finish_instance(instance.id, RunState::Finished).await?;
                info!("实例 {} 执行完成", instance.id);
                if job.trigger_type == TriggerType::FixedDelay {
                    self.rearm_fixed_delay(job).await?;
                }
                if instance.is_workflow_node() {
                    self.advance_workflow(job, &instance).await?;
                }
            }
            terminal => {
                self.finish_instance(instance.id, terminal).await?;
                warn!("实例 {} 以 {terminal:?} 终止", instance.id);
                if instance.is_workflow_node() {
                    self.terminate_workflow_parent(job, &instance, terminal).await?;
                }
            }
        }
        Ok(())
    }

    /// 实例终态迁移，兼容RUNNING/PAUSED/WAITING三个来源
    async fn finish_instance(&self, instance_id: i64, to: RunState) -> SchedulerResult<bool> {
        for from in [RunState::Running, RunState::Paused, RunState::Waiting] {
            if from.can_transition_to(to)
                && self.instances.update_state(instance_id, from, to).await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 生成重试实例（WAITING落库，线性退避后由到期通道拉起）
    async fn spawn_retry_instance(
        &self,
        job: &Job,
        failed: &Instance,
        all_tasks: &[Task],
    ) -> SchedulerResult<()> {
        let attempt = failed.retried_count + 1;
        let delay = Duration::milliseconds(job.retry_delay_ms(attempt));

        let mut attach = InstanceAttach::parse(failed.attach.as_deref());
        attach.failed_node = None;
        if job.retry_type == RetryType::Failed {
            // 仅重放失败分片：沿用原分片参数
            attach.retry_params = Some(
                all_tasks
                    .iter()
                    .filter(|t| t.execute_state == ExecuteState::Failed)
                    .map(|t| t.param.clone())
                    .collect(),
            );
        } else {
            attach.retry_params = None;
        }

        let mut retry = Instance::new(job.id, Utc::now() + delay, RunType::Retry);
        retry.parent_instance_id = Some(failed.id);
        retry.workflow_instance_id = failed.workflow_instance_id;
        retry.retried_count = attempt;
        retry.attach = attach.encode()?;
        let created = self.instances.create(&retry).await?;
        info!(
            "实例 {} 失败，已生成第{}次重试实例 {}",
            failed.id, attempt, created.id
        );
        Ok(())
    }

    /// FIXED_DELAY在实例完成时刻重新armed
    async fn rearm_fixed_delay(&self, job: &Job) -> SchedulerResult<()> {
        let delay = trigger_time::parse_fixed_delay(&job.trigger_value)?;
        let next = Utc::now() + Duration::seconds(delay);
        self.jobs
            .update_next_trigger_time(job.id, Some(next))
            .await?;
        Ok(())
    }

    /// 节点成功后推进DAG：前驱全部成功的后继节点生成WAITING实例；
    /// 全部终端节点成功则父实例FINISHED
    async fn advance_workflow(&self, job: &Job, node_instance: &Instance) -> SchedulerResult<()> {
        let Some(parent_id) = node_instance.workflow_instance_id else {
            return Ok(());
        };
        let graph = disched_core::models::DagGraph::parse(&job.handler)?;
        let children = self.instances.find_children(parent_id).await?;

        // 同一节点的重试实例共享节点键：任一实例FINISHED即节点成功
        let finished_keys: std::collections::BTreeSet<String> = children
            .iter()
            .filter(|c| c.run_state == RunState::Finished)
            .filter_map(|c| InstanceAttach::parse(c.attach.as_deref()).node)
            .collect();
        let existing_keys: std::collections::BTreeSet<String> = children
            .iter()
            .filter_map(|c| InstanceAttach::parse(c.attach.as_deref()).node)
            .collect();

        let Some(current_key) = InstanceAttach::parse(node_instance.attach.as_deref()).node else {
            return Ok(());
        };
        let Some(current) = graph.node_by_key(&current_key) else {
            return Ok(());
        };

        for succ in graph.successors(current) {
            let succ_key = graph.node(succ).key();
            if existing_keys.contains(&succ_key) {
                continue;
            }
            let ready = graph
                .predecessors(succ)
                .iter()
                .all(|&p| finished_keys.contains(&graph.node(p).key()));
            if !ready {
                continue;
            }
            let attach = InstanceAttach {
                node: Some(succ_key.clone()),
                ..Default::default()
            };
            let mut next = Instance::new(job.id, Utc::now(), RunType::Depend);
            next.parent_instance_id = Some(node_instance.id);
            next.workflow_instance_id = Some(parent_id);
            next.attach = attach.encode()?;
            let created = self.instances.create(&next).await?;
            debug!("DAG节点 {succ_key} 前驱齐备，实例 {} 已入队", created.id);
        }

        let complete = graph
            .terminal_nodes()
            .iter()
            .all(|&t| finished_keys.contains(&graph.node(t).key()));
        if complete {
            if self.finish_instance(parent_id, RunState::Finished).await? {
                info!("workflow实例 {parent_id} 全部节点完成");
            }
        }
        Ok(())
    }

    /// 节点终止失败/取消：父实例同步终止，并记录失败节点定位
    async fn terminate_workflow_parent(
        &self,
        _job: &Job,
        node_instance: &Instance,
        terminal: RunState,
    ) -> SchedulerResult<()> {
        let Some(parent_id) = node_instance.workflow_instance_id else {
            return Ok(());
        };
        if self.finish_instance(parent_id, terminal).await? {
            if let Some(mut parent) = self.instances.get_by_id(parent_id).await? {
                let mut attach = InstanceAttach::parse(parent.attach.as_deref());
                attach.failed_node =
                    InstanceAttach::parse(node_instance.attach.as_deref()).node;
                parent.attach = attach.encode()?;
                self.instances.update(&parent).await?;
            }
            warn!(
                "workflow实例 {parent_id} 因节点实例 {} 以 {terminal:?} 终止",
                node_instance.id
            );
        }
        Ok(())
    }

    /// 暂停：RUNNING -> PAUSED；执行中的task向Worker发PAUSE指令，
    /// Worker在协作取消点退回WAITING
    pub async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<()> {
        let instance = self.require_instance(instance_id).await?;
        if instance.is_workflow_parent() {
            for child in self.instances.find_children(instance_id).await? {
                if child.is_running() {
                    Box::pin(self.pause_instance(child.id)).await?;
                }
            }
        }
        if !self
            .instances
            .update_state(instance_id, RunState::Running, RunState::Paused)
            .await?
        {
            return Err(SchedulerError::IllegalStateTransition {
                from: format!("{:?}", instance.run_state),
                to: format!("{:?}", RunState::Paused),
            });
        }
        self.notify_executing_tasks(&instance, Operation::Pause).await
    }

    /// 取消：终态意图，递归取消未终态task与workflow子实例，不消耗重试预算
    pub async fn cancel_instance(&self, instance_id: i64) -> SchedulerResult<()> {
        let instance = self.require_instance(instance_id).await?;
        if instance.is_terminal() {
            return Ok(());
        }
        if instance.is_workflow_parent() {
            for child in self.instances.find_children(instance_id).await? {
                if !child.is_terminal() {
                    Box::pin(self.cancel_instance(child.id)).await?;
                }
            }
        }

        for task in self.tasks.find_by_instance(instance_id).await? {
            match task.execute_state {
                ExecuteState::Waiting => {
                    self.tasks
                        .update_state(
                            task.id,
                            ExecuteState::Waiting,
                            ExecuteState::Canceled,
                            None,
                            None,
                        )
                        .await?;
                }
                ExecuteState::Executing => {
                    // 先通知Worker协作停止，再在存储侧落为CANCELED；
                    // Worker之后的迟到汇报会被终态优先规则忽略
                    self.notify_task(&instance, &task, Operation::Cancel).await;
                    self.tasks
                        .update_state(
                            task.id,
                            ExecuteState::Executing,
                            ExecuteState::Canceled,
                            None,
                            None,
                        )
                        .await?;
                }
                _ => {}
            }
        }
        self.finish_instance(instance_id, RunState::Canceled).await?;
        info!("实例 {instance_id} 已取消");
        Ok(())
    }

    /// 恢复：PAUSED -> RUNNING；等待中的task借恢复通道重新路由派发
    pub async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<()> {
        let instance = self.require_instance(instance_id).await?;
        if instance.is_workflow_parent() {
            for child in self.instances.find_children(instance_id).await? {
                if child.run_state == RunState::Paused {
                    Box::pin(self.resume_instance(child.id)).await?;
                }
            }
        }
        if !self
            .instances
            .update_state(instance_id, RunState::Paused, RunState::Running)
            .await?
        {
            return Err(SchedulerError::IllegalStateTransition {
                from: format!("{:?}", instance.run_state),
                to: format!("{:?}", RunState::Running),
            });
        }
        let job_id = instance.job_id;
        for task in self.tasks.find_by_instance(instance_id).await? {
            if task.is_waiting() {
                self.events
                    .record(DispatchFailedEvent::new(
                        job_id,
                        instance_id,
                        task.id,
                        task.worker.clone(),
                        "实例恢复，重新派发".to_string(),
                    ))
                    .await?;
            }
        }
        info!("实例 {instance_id} 已恢复");
        Ok(())
    }

    async fn require_instance(&self, instance_id: i64) -> SchedulerResult<Instance> {
        self.instances
            .get_by_id(instance_id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound { id: instance_id })
    }

    async fn notify_executing_tasks(
        &self,
        instance: &Instance,
        operation: Operation,
    ) -> SchedulerResult<()> {
        for task in self.tasks.find_by_instance(instance.id).await? {
            if task.execute_state == ExecuteState::Executing {
                self.notify_task(instance, &task, operation).await;
            }
        }
        Ok(())
    }

    /// 向task所在Worker下发控制指令；通知失败只记日志，不阻塞状态推进
    async fn notify_task(&self, instance: &Instance, task: &Task, operation: Operation) {
        let Ok(Some(job)) = self.jobs.get_by_id(instance.job_id).await else {
            return;
        };
        let token = crate::group_supervisor_token(self.groups.as_ref(), &job.group).await;
        match crate::build_payload(&job, instance, task, operation, token) {
            Ok(payload) => {
                if let Err(e) = self.dispatcher.dispatch(&payload).await {
                    warn!("控制指令 {operation:?} 下发失败: task={} {e}", task.id);
                }
            }
            Err(e) => warn!("控制指令构建失败: task={} {e}", task.id),
        }
    }
}

#[async_trait]
impl TaskReporter for LifecycleService {
    async fn report(&self, report: TaskReport) -> SchedulerResult<()> {
        self.handle_report(&report).await
    }
}
