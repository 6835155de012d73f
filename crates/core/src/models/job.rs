use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务定义
///
/// 表示一个可被调度执行的作业，包含触发、路由、重试等完整配置。
/// `version`字段用于乐观锁：多个supervisor副本并发扫描同一到期任务时，
/// 只有版本匹配的条件更新能够认领触发，落败方直接放弃本轮。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// 分组（租户/命名空间），Worker按分组注册并接收派发
    pub group: String,
    pub name: String,
    /// NORMAL任务为处理器注册名；WORKFLOW任务为DAG表达式
    pub handler: String,
    pub job_type: JobType,
    pub param: String,
    pub trigger_type: TriggerType,
    /// 编码取决于trigger_type：CRON表达式、ONCE时间点、PERIOD周期秒数等
    pub trigger_value: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub misfire_strategy: MisfireStrategy,
    pub collision_strategy: CollisionStrategy,
    pub retry_type: RetryType,
    pub retry_count: i32,
    pub retry_interval_ms: i64,
    pub route_strategy: RouteStrategy,
    pub execute_timeout_ms: i64,
    pub last_trigger_time: Option<DateTime<Utc>>,
    pub next_trigger_time: Option<DateTime<Utc>>,
    pub state: JobState,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobType {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "WORKFLOW")]
    Workflow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[serde(rename = "ENABLED")]
    Enabled,
    #[serde(rename = "DISABLED")]
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerType {
    #[serde(rename = "CRON")]
    Cron,
    #[serde(rename = "ONCE")]
    Once,
    #[serde(rename = "PERIOD")]
    Period,
    #[serde(rename = "FIXED_DELAY")]
    FixedDelay,
    #[serde(rename = "DEPEND")]
    Depend,
}

/// 错过触发（misfire）处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MisfireStrategy {
    /// 跳过所有已错过的触发点
    #[serde(rename = "DISCARD")]
    Discard,
    /// 所有错过的触发点合并为最近一次
    #[serde(rename = "LAST")]
    Last,
    /// 逐个补偿每一个错过的触发点
    #[serde(rename = "EVERY")]
    Every,
}

/// 碰撞策略：新触发到来时上一实例尚未终止的处理方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollisionStrategy {
    #[serde(rename = "DISCARD")]
    Discard,
    #[serde(rename = "SERIAL")]
    Serial,
    #[serde(rename = "OVERRIDE")]
    Override,
    #[serde(rename = "PARALLEL")]
    Parallel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RetryType {
    #[serde(rename = "NONE")]
    None,
    /// 重新分片后整体重试
    #[serde(rename = "ALL")]
    All,
    /// 仅重试失败的task
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RouteStrategy {
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
    #[serde(rename = "RANDOM")]
    Random,
    #[serde(rename = "CONSISTENT_HASH")]
    ConsistentHash,
    #[serde(rename = "LOCAL_PRIORITY")]
    LocalPriority,
}

impl Job {
    pub fn new(group: String, name: String, handler: String, trigger_type: TriggerType, trigger_value: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 由存储生成
            group,
            name,
            handler,
            job_type: JobType::Normal,
            param: String::new(),
            trigger_type,
            trigger_value,
            start_time: None,
            end_time: None,
            misfire_strategy: MisfireStrategy::Last,
            collision_strategy: CollisionStrategy::Discard,
            retry_type: RetryType::None,
            retry_count: 0,
            retry_interval_ms: 1000,
            route_strategy: RouteStrategy::RoundRobin,
            execute_timeout_ms: 300_000,
            last_trigger_time: None,
            next_trigger_time: None,
            state: JobState::Enabled,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, JobState::Enabled)
    }

    pub fn is_workflow(&self) -> bool {
        matches!(self.job_type, JobType::Workflow)
    }

    /// 重试预算是否还有剩余
    pub fn retry_budget_remains(&self, retried_count: i32) -> bool {
        self.retry_type != RetryType::None && retried_count < self.retry_count
    }

    /// 第attempt次重试的延迟（线性退避）
    pub fn retry_delay_ms(&self, attempt: i32) -> i64 {
        self.retry_interval_ms * i64::from(attempt.max(1))
    }
}
