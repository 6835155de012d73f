use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::errors::SchedulerResult;
use crate::models::{
    DispatchFailedEvent, ExecuteState, Group, Instance, InstancePageQuery, Job, JobPageQuery,
    JobState, Page, RunState, ServerIdentity, Task,
};
use crate::traits::repository::{
    DispatchEventRepository, GroupRepository, InstanceRepository, JobRepository, TaskRepository,
};

/// 内存存储：全部仓储接口的参考实现
///
/// 单进程模式与测试使用。条件更新在写锁内完成，
/// 语义上等价于存储侧的行级版本条件更新。
pub struct MemoryStore {
    jobs: RwLock<HashMap<i64, Job>>,
    instances: RwLock<HashMap<i64, Instance>>,
    tasks: RwLock<HashMap<i64, Task>>,
    events: RwLock<Vec<DispatchFailedEvent>>,
    groups: RwLock<HashMap<String, Group>>,
    job_seq: AtomicI64,
    instance_seq: AtomicI64,
    task_seq: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            groups: RwLock::new(HashMap::new()),
            job_seq: AtomicI64::new(1),
            instance_seq: AtomicI64::new(1),
            task_seq: AtomicI64::new(1),
        }
    }

    fn next_id(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::Relaxed)
    }

    fn paginate<T: Clone>(mut items: Vec<T>, page: Option<i64>, page_size: Option<i64>) -> Page<T> {
        let page = page.unwrap_or(1).max(1);
        let page_size = page_size.unwrap_or(20).clamp(1, 200);
        let total = items.len() as i64;
        let start = ((page - 1) * page_size) as usize;
        let items = if start >= items.len() {
            Vec::new()
        } else {
            items.split_off(start).into_iter().take(page_size as usize).collect()
        };
        Page::new(items, total, page, page_size)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, job: &Job) -> SchedulerResult<Job> {
        let mut stored = job.clone();
        stored.id = Self::next_id(&self.job_seq);
        stored.created_at = Utc::now();
        stored.updated_at = stored.created_at;
        self.jobs.write().await.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, job: &Job) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.version == job.version => {
                let mut updated = job.clone();
                updated.version += 1;
                updated.updated_at = Utc::now();
                *existing = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, job_id: i64) -> SchedulerResult<bool> {
        Ok(self.jobs.write().await.remove(&job_id).is_some())
    }

    async fn get_by_id(&self, job_id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_state(&self, job_id: i64, to: JobState) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.state = to;
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> SchedulerResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_enabled())
            .filter(|j| matches!(j.next_trigger_time, Some(t) if t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_trigger_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_trigger(
        &self,
        job_id: i64,
        version: i32,
        last_trigger_time: DateTime<Utc>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            // 版本不匹配即认领失败，调用方放弃本轮
            Some(job) if job.version == version => {
                job.last_trigger_time = Some(last_trigger_time);
                job.next_trigger_time = next_trigger_time;
                job.version += 1;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_next_trigger_time(
        &self,
        job_id: i64,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) => {
                job.next_trigger_time = next_trigger_time;
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn page_query(&self, query: &JobPageQuery) -> SchedulerResult<Page<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| query.group.as_deref().is_none_or(|g| j.group == g))
            .filter(|j| query.name_like.as_deref().is_none_or(|n| j.name.contains(n)))
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.id);
        Ok(Self::paginate(matched, query.page, query.page_size))
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn create(&self, instance: &Instance) -> SchedulerResult<Instance> {
        let mut stored = instance.clone();
        stored.id = Self::next_id(&self.instance_seq);
        // workflow父实例的workflow_instance_id指向自身，创建时才知道id
        if stored.workflow_instance_id == Some(0) {
            stored.workflow_instance_id = Some(stored.id);
        }
        self.instances.write().await.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, instance_id: i64) -> SchedulerResult<Option<Instance>> {
        Ok(self.instances.read().await.get(&instance_id).cloned())
    }

    async fn update_state(
        &self,
        instance_id: i64,
        from: RunState,
        to: RunState,
    ) -> SchedulerResult<bool> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance_id) {
            Some(instance) if instance.run_state == from => {
                instance.run_state = to;
                if to == RunState::Running && instance.started_at.is_none() {
                    instance.started_at = Some(Utc::now());
                }
                if to.is_terminal() {
                    instance.ended_at = Some(Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, instance: &Instance) -> SchedulerResult<bool> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_active_by_job(&self, job_id: i64) -> SchedulerResult<Vec<Instance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.job_id == job_id && !i.is_terminal())
            .cloned()
            .collect())
    }

    async fn find_waiting_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Instance>> {
        let instances = self.instances.read().await;
        let mut due: Vec<Instance> = instances
            .values()
            .filter(|i| i.run_state == RunState::Waiting && i.trigger_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.trigger_time, i.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_children(&self, workflow_instance_id: i64) -> SchedulerResult<Vec<Instance>> {
        let instances = self.instances.read().await;
        let mut children: Vec<Instance> = instances
            .values()
            .filter(|i| i.workflow_instance_id == Some(workflow_instance_id) && i.id != workflow_instance_id)
            .cloned()
            .collect();
        children.sort_by_key(|i| i.id);
        Ok(children)
    }

    async fn page_query(&self, query: &InstancePageQuery) -> SchedulerResult<Page<Instance>> {
        let instances = self.instances.read().await;
        let mut matched: Vec<Instance> = instances
            .values()
            .filter(|i| query.job_id.is_none_or(|id| i.job_id == id))
            .filter(|i| query.run_state.is_none_or(|s| i.run_state == s))
            .cloned()
            .collect();
        matched.sort_by_key(|i| i.id);
        Ok(Self::paginate(matched, query.page, query.page_size))
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<Vec<Task>> {
        let mut stored_tasks = Vec::with_capacity(tasks.len());
        let mut map = self.tasks.write().await;
        for task in tasks {
            let mut stored = task.clone();
            stored.id = Self::next_id(&self.task_seq);
            map.insert(stored.id, stored.clone());
            stored_tasks.push(stored);
        }
        Ok(stored_tasks)
    }

    async fn get_by_id(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn find_by_instance(&self, instance_id: i64) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.task_no);
        Ok(matched)
    }

    async fn update_state(
        &self,
        task_id: i64,
        from: ExecuteState,
        to: ExecuteState,
        result: Option<String>,
        error_msg: Option<String>,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(task) if task.execute_state == from => {
                task.execute_state = to;
                if to == ExecuteState::Executing {
                    task.started_at = Some(Utc::now());
                }
                if to.is_terminal() {
                    task.ended_at = Some(Utc::now());
                }
                if result.is_some() {
                    task.result = result;
                }
                if error_msg.is_some() {
                    task.error_msg = error_msg;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, task: &Task) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reassign_workers(
        &self,
        task_ids: &[i64],
        worker: &ServerIdentity,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.write().await;
        let mut changed = false;
        for id in task_ids {
            if let Some(task) = tasks.get_mut(id) {
                task.worker = Some(worker.clone());
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl DispatchEventRepository for MemoryStore {
    async fn record(&self, event: DispatchFailedEvent) -> SchedulerResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn drain(&self, limit: usize) -> SchedulerResult<Vec<DispatchFailedEvent>> {
        let mut events = self.events.write().await;
        let n = events.len().min(limit);
        Ok(events.drain(..n).collect())
    }
}

#[async_trait]
impl GroupRepository for MemoryStore {
    async fn get(&self, name: &str) -> SchedulerResult<Option<Group>> {
        Ok(self.groups.read().await.get(name).cloned())
    }

    async fn upsert(&self, group: Group) -> SchedulerResult<()> {
        self.groups.write().await.insert(group.name.clone(), group);
        Ok(())
    }

    async fn list(&self) -> SchedulerResult<Vec<Group>> {
        Ok(self.groups.read().await.values().cloned().collect())
    }
}
