use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use disched_core::errors::SchedulerResult;
use disched_core::models::{
    DispatchPayload, ExecuteState, Operation, ServerIdentity, ShutdownStrategy, TaskReport,
};
use disched_core::traits::{ExecuteContext, ExecuteOutcome, TaskReporter};
use disched_core::HandlerRegistry;
use disched_dispatch::TaskReceiver;

use crate::timing_wheel::TimingWheel;

/// 执行槽位：容量覆盖"轮中排队+执行中"的总数
///
/// 缩容不打断在执行任务，仅让后续接收在新容量上限处拒收。
struct TaskSlots {
    capacity: AtomicUsize,
    used: AtomicUsize,
}

impl TaskSlots {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            used: AtomicUsize::new(0),
        }
    }

    fn try_reserve(&self) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if current >= self.capacity.load(Ordering::Acquire) {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.used.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 近期本地终态的task_id环形记录
///
/// 供迟到的重复投递幂等吸收，防止处理器副作用二次执行。
/// 只记终态：暂停回WAITING的任务仍要接受RESUME重投。
struct RecentDone {
    order: VecDeque<i64>,
    set: HashSet<i64>,
    cap: usize,
}

impl RecentDone {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
            cap,
        }
    }

    fn insert(&mut self, task_id: i64) {
        if !self.set.insert(task_id) {
            return;
        }
        self.order.push_back(task_id);
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, task_id: i64) -> bool {
        self.set.contains(&task_id)
    }
}

/// 停止意图：决定协作式退出后的汇报状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    /// 退回WAITING，保留重试预算
    Pause,
    Cancel,
}

/// 执行中任务的控制句柄
struct RunningTask {
    cancel_flag: Arc<AtomicBool>,
    intent: Option<StopIntent>,
    shutdown_strategy: ShutdownStrategy,
    instance_id: i64,
    supervisor_token: String,
}

/// Worker运行时快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetrics {
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
}

/// Worker执行服务
///
/// 接收派发载荷入时间轮，到期后在容量上限内并发执行，
/// 经reporter向supervisor汇报EXECUTING与终态。
pub struct WorkerService {
    identity: ServerIdentity,
    handlers: Arc<HandlerRegistry>,
    reporter: Arc<dyn TaskReporter>,
    wheel: TimingWheel,
    slots: TaskSlots,
    controls: Mutex<HashMap<i64, RunningTask>>,
    recent_done: Mutex<RecentDone>,
}

/// 近期终态记录的容量
const RECENT_DONE_CAP: usize = 256;

impl WorkerService {
    pub fn new(
        identity: ServerIdentity,
        handlers: Arc<HandlerRegistry>,
        reporter: Arc<dyn TaskReporter>,
        max_concurrent_tasks: usize,
        tick_interval_ms: u64,
        wheel_slots: usize,
    ) -> Self {
        Self {
            identity,
            handlers,
            reporter,
            wheel: TimingWheel::new(wheel_slots, tick_interval_ms),
            slots: TaskSlots::new(max_concurrent_tasks.max(1)),
            controls: Mutex::new(HashMap::new()),
            recent_done: Mutex::new(RecentDone::new(RECENT_DONE_CAP)),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn metrics(&self) -> WorkerMetrics {
        WorkerMetrics {
            capacity: self.slots.capacity.load(Ordering::Acquire),
            running: self.lock_controls().len(),
            queued: self.wheel.len(),
        }
    }

    /// 在线调整并发容量；缩容只约束后续接收
    pub fn resize_pool(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.slots.capacity.store(capacity, Ordering::Release);
        info!("执行池容量调整为 {capacity}");
    }

    fn lock_controls(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RunningTask>> {
        self.controls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_done(&self, task_id: i64) {
        self.recent_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id);
    }

    fn accept(&self, payload: DispatchPayload) -> bool {
        if self.lock_controls().contains_key(&payload.task_id) {
            // 已在执行，重复投递幂等吸收
            return true;
        }
        if self
            .recent_done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(payload.task_id)
        {
            // 本机已到终态，迟到的重复投递不再二次执行
            debug!("任务 {} 已在本Worker结束，重复投递幂等吸收", payload.task_id);
            return true;
        }
        if !self.slots.try_reserve() {
            warn!("任务 {} 被拒收：执行槽位已满", payload.task_id);
            return false;
        }
        let task_id = payload.task_id;
        if self.wheel.offer(payload, Utc::now()) {
            debug!("任务 {task_id} 已入时间轮");
        } else {
            // 已在轮中排队，退还本次预留
            self.slots.release();
        }
        true
    }

    /// PAUSE/CANCEL控制：未到期的条目直接出轮汇报，
    /// 执行中的置协作取消位，由执行协程汇报退出状态。
    async fn stop(&self, task_id: i64, intent: StopIntent) -> SchedulerResult<()> {
        if let Some(queued) = self.wheel.remove(task_id) {
            self.slots.release();
            let to_state = match intent {
                StopIntent::Pause => ExecuteState::Waiting,
                StopIntent::Cancel => ExecuteState::Canceled,
            };
            if to_state.is_terminal() {
                self.mark_done(task_id);
            }
            self.report(
                task_id,
                queued.instance_id,
                &queued.supervisor_token,
                to_state,
                None,
                None,
            )
            .await;
            return Ok(());
        }
        let flag = {
            let mut controls = self.lock_controls();
            match controls.get_mut(&task_id) {
                Some(running) => {
                    running.intent = Some(intent);
                    Some(running.cancel_flag.clone())
                }
                None => None,
            }
        };
        match flag {
            Some(flag) => flag.store(true, Ordering::Release),
            // 任务已结束或从未到达，迟到的控制操作无事可做
            None => debug!("控制操作忽略：任务 {task_id} 不在本Worker"),
        }
        Ok(())
    }

    /// 时间轮转动一格并启动到期任务
    pub fn tick(self: &Arc<Self>) {
        for payload in self.wheel.tick() {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.execute(payload).await;
            });
        }
    }

    async fn execute(&self, payload: DispatchPayload) {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.lock_controls().insert(
            payload.task_id,
            RunningTask {
                cancel_flag: cancel_flag.clone(),
                intent: None,
                shutdown_strategy: payload.shutdown_strategy,
                instance_id: payload.instance_id,
                supervisor_token: payload.supervisor_token.clone(),
            },
        );
        self.report(
            payload.task_id,
            payload.instance_id,
            &payload.supervisor_token,
            ExecuteState::Executing,
            None,
            None,
        )
        .await;

        let (to_state, result, error_msg) = self.run_handler(&payload, cancel_flag).await;
        let intent = self
            .lock_controls()
            .remove(&payload.task_id)
            .and_then(|running| running.intent);
        self.slots.release();

        // 协作取消的退出状态由控制意图决定：PAUSE退回WAITING
        let to_state = match (to_state, intent) {
            (ExecuteState::Canceled, Some(StopIntent::Pause)) => ExecuteState::Waiting,
            (state, _) => state,
        };
        // WAITING不入终态记录，RESUME重投同一task仍须被接受
        if to_state.is_terminal() {
            self.mark_done(payload.task_id);
        }
        self.report(
            payload.task_id,
            payload.instance_id,
            &payload.supervisor_token,
            to_state,
            result,
            error_msg,
        )
        .await;
    }

    async fn run_handler(
        &self,
        payload: &DispatchPayload,
        cancel_flag: Arc<AtomicBool>,
    ) -> (ExecuteState, Option<String>, Option<String>) {
        let handler = match self.handlers.get(&payload.job_handler) {
            Ok(handler) => handler,
            Err(e) => return (ExecuteState::Failed, None, Some(e.to_string())),
        };
        let ctx = ExecuteContext::new(
            payload.task_id,
            payload.instance_id,
            payload.task_no,
            payload.task_count,
            payload.task_param.clone(),
            cancel_flag.clone(),
        );
        let timeout = Duration::from_millis(payload.execute_timeout_ms.max(1) as u64);
        match tokio::time::timeout(timeout, handler.execute(&ctx)).await {
            Ok(Ok(ExecuteOutcome::Finished(result))) => (ExecuteState::Finished, result, None),
            Ok(Ok(ExecuteOutcome::Paused)) => (ExecuteState::Waiting, None, None),
            Ok(Ok(ExecuteOutcome::Canceled)) => (ExecuteState::Canceled, None, None),
            Ok(Err(e)) => (ExecuteState::Failed, None, Some(e.to_string())),
            Err(_) => {
                // 超时后置取消位，残留的处理器协程在安全点自行退出
                cancel_flag.store(true, Ordering::Release);
                (
                    ExecuteState::Failed,
                    None,
                    Some(format!("执行超时（{}ms）", payload.execute_timeout_ms)),
                )
            }
        }
    }

    async fn report(
        &self,
        task_id: i64,
        instance_id: i64,
        supervisor_token: &str,
        to_state: ExecuteState,
        result: Option<String>,
        error_msg: Option<String>,
    ) {
        let report = TaskReport {
            task_id,
            instance_id,
            to_state,
            worker: self.identity.clone(),
            result,
            error_msg,
            supervisor_token: supervisor_token.to_string(),
            reported_at: Utc::now(),
        };
        if let Err(e) = self.reporter.report(report).await {
            warn!("任务 {task_id} 状态 {to_state:?} 汇报失败: {e}");
        }
    }

    /// 进程关闭：排队与执行中的任务按各自shutdown_strategy处置
    pub async fn drain_on_shutdown(&self) {
        for queued in self.wheel.drain_all() {
            self.slots.release();
            self.apply_shutdown(
                queued.task_id,
                queued.instance_id,
                &queued.supervisor_token,
                queued.shutdown_strategy,
            )
            .await;
        }
        let running: Vec<(i64, RunningTask)> = self.lock_controls().drain().collect();
        for (task_id, task) in running {
            task.cancel_flag.store(true, Ordering::Release);
            self.apply_shutdown(
                task_id,
                task.instance_id,
                &task.supervisor_token,
                task.shutdown_strategy,
            )
            .await;
        }
    }

    async fn apply_shutdown(
        &self,
        task_id: i64,
        instance_id: i64,
        supervisor_token: &str,
        strategy: ShutdownStrategy,
    ) {
        let to_state = match strategy {
            // RESUME/PAUSE均退回WAITING，区别在supervisor侧是否自动改派
            ShutdownStrategy::Resume | ShutdownStrategy::Pause => ExecuteState::Waiting,
            ShutdownStrategy::Cancel => ExecuteState::Canceled,
        };
        self.report(task_id, instance_id, supervisor_token, to_state, None, None)
            .await;
    }
}

#[async_trait]
impl TaskReceiver for WorkerService {
    async fn receive(&self, payload: DispatchPayload) -> SchedulerResult<bool> {
        match payload.operation {
            Operation::Trigger | Operation::Resume => Ok(self.accept(payload)),
            Operation::Pause => {
                self.stop(payload.task_id, StopIntent::Pause).await?;
                Ok(true)
            }
            Operation::Cancel => {
                self.stop(payload.task_id, StopIntent::Cancel).await?;
                Ok(true)
            }
        }
    }
}

/// 时间轮转动循环
pub fn run_wheel_loop(
    service: Arc<WorkerService>,
    tick_interval_ms: u64,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Worker时间轮启动: {}", service.identity());
        loop {
            tokio::select! {
                _ = ticker.tick() => service.tick(),
                _ = shutdown.recv() => {
                    info!("Worker时间轮停止，处置在途任务");
                    service.drain_on_shutdown().await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use disched_core::models::{JobType, RouteStrategy};

    /// 记录全部汇报供断言
    struct RecordingReporter {
        reports: Mutex<Vec<TaskReport>>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            Self {
                reports: Mutex::new(Vec::new()),
            }
        }

        fn states(&self, task_id: i64) -> Vec<ExecuteState> {
            self.reports
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.task_id == task_id)
                .map(|r| r.to_state)
                .collect()
        }

        async fn wait_for(&self, task_id: i64, state: ExecuteState) {
            for _ in 0..200 {
                if self.states(task_id).contains(&state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("任务 {task_id} 未在期限内到达 {state:?}");
        }
    }

    #[async_trait]
    impl TaskReporter for RecordingReporter {
        async fn report(&self, report: TaskReport) -> SchedulerResult<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn service(reporter: Arc<RecordingReporter>, capacity: usize) -> Arc<WorkerService> {
        Arc::new(WorkerService::new(
            ServerIdentity::new("default", "w1", "127.0.0.1", 8200),
            Arc::new(HandlerRegistry::with_builtin()),
            reporter,
            capacity,
            50,
            60,
        ))
    }

    fn payload(task_id: i64, handler: &str, param: &str, timeout_ms: i64) -> DispatchPayload {
        DispatchPayload {
            operation: Operation::Trigger,
            task_id,
            task_no: 1,
            task_count: 1,
            instance_id: 1,
            workflow_instance_id: None,
            trigger_time: Utc::now() - ChronoDuration::seconds(1),
            job_id: 1,
            job_type: JobType::Normal,
            job_handler: handler.to_string(),
            task_param: param.to_string(),
            route_strategy: RouteStrategy::RoundRobin,
            shutdown_strategy: ShutdownStrategy::Resume,
            execute_timeout_ms: timeout_ms,
            supervisor_token: "sup-token".to_string(),
            worker: ServerIdentity::new("default", "w1", "127.0.0.1", 8200),
        }
    }

    fn control(task_id: i64, operation: Operation) -> DispatchPayload {
        let mut p = payload(task_id, "noop", "", 60_000);
        p.operation = operation;
        p
    }

    #[tokio::test]
    async fn test_trigger_reports_executing_then_finished() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        assert!(svc.receive(payload(1, "noop", "", 60_000)).await.unwrap());
        svc.tick();
        reporter.wait_for(1, ExecuteState::Finished).await;

        let states = reporter.states(1);
        assert_eq!(states[0], ExecuteState::Executing);
        assert_eq!(*states.last().unwrap(), ExecuteState::Finished);
        // 汇报回带supervisor凭据
        let reports = reporter.reports.lock().unwrap();
        assert!(reports.iter().all(|r| r.supervisor_token == "sup-token"));
        drop(reports);
        assert_eq!(svc.metrics().running, 0);
    }

    #[tokio::test]
    async fn test_handler_sees_shard_position_from_payload() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        let mut sharded = payload(1, "noop", "", 60_000);
        sharded.task_no = 2;
        sharded.task_count = 3;
        assert!(svc.receive(sharded).await.unwrap());
        svc.tick();
        reporter.wait_for(1, ExecuteState::Finished).await;

        // noop回显自身分片序号，证明上下文携带的是载荷里的分片位置
        let reports = reporter.reports.lock().unwrap();
        let finished = reports
            .iter()
            .find(|r| r.to_state == ExecuteState::Finished)
            .unwrap();
        assert_eq!(finished.result.as_deref(), Some("noop:2/3"));
    }

    #[tokio::test]
    async fn test_capacity_overflow_is_rejected() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter, 2);

        assert!(svc.receive(payload(1, "sleep", "5000", 60_000)).await.unwrap());
        assert!(svc.receive(payload(2, "sleep", "5000", 60_000)).await.unwrap());
        // 第三个超出容量，拒收而非排队
        assert!(!svc.receive(payload(3, "sleep", "5000", 60_000)).await.unwrap());
        assert_eq!(svc.metrics().queued, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter, 4);

        assert!(svc.receive(payload(1, "sleep", "5000", 60_000)).await.unwrap());
        assert!(svc.receive(payload(1, "sleep", "5000", 60_000)).await.unwrap());
        assert_eq!(svc.metrics().queued, 1);
        // 重复投递不额外占用槽位
        assert!(svc.receive(payload(2, "sleep", "5000", 60_000)).await.unwrap());
        assert!(svc.receive(payload(3, "sleep", "5000", 60_000)).await.unwrap());
        assert!(svc.receive(payload(4, "sleep", "5000", 60_000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_does_not_rerun() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        assert!(svc.receive(payload(1, "noop", "", 60_000)).await.unwrap());
        svc.tick();
        reporter.wait_for(1, ExecuteState::Finished).await;

        // 结束后的迟到重复投递：接受但不再执行
        assert!(svc.receive(payload(1, "noop", "", 60_000)).await.unwrap());
        svc.tick();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            reporter.states(1),
            vec![ExecuteState::Executing, ExecuteState::Finished]
        );
        assert_eq!(svc.metrics().queued, 0);
        assert_eq!(svc.metrics().running, 0);
    }

    #[tokio::test]
    async fn test_pause_running_task_reports_waiting() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        svc.receive(payload(1, "sleep", "10000", 60_000)).await.unwrap();
        svc.tick();
        reporter.wait_for(1, ExecuteState::Executing).await;

        svc.receive(control(1, Operation::Pause)).await.unwrap();
        reporter.wait_for(1, ExecuteState::Waiting).await;
        assert!(!reporter.states(1).contains(&ExecuteState::Canceled));
        assert_eq!(svc.metrics().running, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_task_reports_canceled() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        svc.receive(payload(1, "sleep", "10000", 60_000)).await.unwrap();
        svc.tick();
        reporter.wait_for(1, ExecuteState::Executing).await;

        svc.receive(control(1, Operation::Cancel)).await.unwrap();
        reporter.wait_for(1, ExecuteState::Canceled).await;
    }

    #[tokio::test]
    async fn test_cancel_queued_task_skips_execution() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        svc.receive(payload(1, "sleep", "60000", 60_000)).await.unwrap();
        svc.receive(control(1, Operation::Cancel)).await.unwrap();
        reporter.wait_for(1, ExecuteState::Canceled).await;

        // 未执行过：没有EXECUTING汇报，槽位已释放
        assert!(!reporter.states(1).contains(&ExecuteState::Executing));
        assert_eq!(svc.metrics().queued, 0);
        assert_eq!(svc.metrics().running, 0);
    }

    #[tokio::test]
    async fn test_timeout_reports_failed() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        svc.receive(payload(1, "sleep", "10000", 100)).await.unwrap();
        svc.tick();
        reporter.wait_for(1, ExecuteState::Failed).await;

        let reports = reporter.reports.lock().unwrap();
        let failed = reports
            .iter()
            .find(|r| r.to_state == ExecuteState::Failed)
            .unwrap();
        assert!(failed.error_msg.as_deref().unwrap_or("").contains("超时"));
    }

    #[tokio::test]
    async fn test_unknown_handler_reports_failed() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        svc.receive(payload(1, "ghost", "", 60_000)).await.unwrap();
        svc.tick();
        reporter.wait_for(1, ExecuteState::Failed).await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_per_strategy() {
        let reporter = Arc::new(RecordingReporter::new());
        let svc = service(reporter.clone(), 4);

        let mut resume = payload(1, "sleep", "60000", 60_000);
        resume.shutdown_strategy = ShutdownStrategy::Resume;
        let mut cancel = payload(2, "sleep", "60000", 60_000);
        cancel.shutdown_strategy = ShutdownStrategy::Cancel;
        svc.receive(resume).await.unwrap();
        svc.receive(cancel).await.unwrap();

        svc.drain_on_shutdown().await;
        assert_eq!(reporter.states(1), vec![ExecuteState::Waiting]);
        assert_eq!(reporter.states(2), vec![ExecuteState::Canceled]);
        assert_eq!(svc.metrics().queued, 0);
    }
}
