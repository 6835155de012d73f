use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobType, RouteStrategy};
use super::server::ServerIdentity;
use super::task::ExecuteState;

/// 派发操作类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    #[serde(rename = "TRIGGER")]
    Trigger,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "CANCEL")]
    Cancel,
    #[serde(rename = "RESUME")]
    Resume,
}

/// Worker进程关闭时对在执行任务的处置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShutdownStrategy {
    #[serde(rename = "RESUME")]
    Resume,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "CANCEL")]
    Cancel,
}

/// 派发线协议载荷
///
/// 字段名跨版本保持稳定（serde snake_case），supervisor与worker
/// 两侧按此结构互操作。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchPayload {
    pub operation: Operation,
    pub task_id: i64,
    /// 分片序号（1起）与总分片数，处理器据此认领自己的数据切片
    pub task_no: i32,
    pub task_count: i32,
    pub instance_id: i64,
    pub workflow_instance_id: Option<i64>,
    pub trigger_time: DateTime<Utc>,
    pub job_id: i64,
    pub job_type: JobType,
    /// 处理器注册名
    pub job_handler: String,
    pub task_param: String,
    pub route_strategy: RouteStrategy,
    pub shutdown_strategy: ShutdownStrategy,
    pub execute_timeout_ms: i64,
    /// supervisor侧凭据，worker汇报时回带校验
    pub supervisor_token: String,
    pub worker: ServerIdentity,
}

impl DispatchPayload {
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Worker执行汇报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: i64,
    pub instance_id: i64,
    pub to_state: ExecuteState,
    pub worker: ServerIdentity,
    pub result: Option<String>,
    pub error_msg: Option<String>,
    pub supervisor_token: String,
    pub reported_at: DateTime<Utc>,
}
